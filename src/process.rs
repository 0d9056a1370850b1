//! # Process Glue
//!
//! Matches a running process to its on-disk image through the `/proc`
//! filesystem: numeric entries, `comm` for the name, the `exe` link for the
//! image path. Also the reader-to-disassembler glue for "show me this
//! function's annotated assembly".

use std::fs;
use std::path::PathBuf;

use log::debug;

use crate::disasm::{Disassembler, InstructionLine};
use crate::elf::ElfImage;
use crate::error::{InspectError, InspectResult};

fn numeric_proc_entries() -> InspectResult<Vec<i32>> {
    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        if let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() {
            pids.push(pid);
        }
    }
    Ok(pids)
}

fn comm(pid: i32) -> Option<String> {
    fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|name| name.trim_end_matches('\n').to_string())
}

/// Names of all running processes whose `comm` is readable.
pub fn running_processes() -> InspectResult<Vec<String>> {
    Ok(numeric_proc_entries()?
        .into_iter()
        .filter_map(comm)
        .filter(|name| !name.is_empty())
        .collect())
}

/// First process whose `comm` equals `name`.
pub fn pid_by_name(name: &str) -> InspectResult<i32> {
    numeric_proc_entries()?
        .into_iter()
        .find(|pid| comm(*pid).as_deref() == Some(name))
        .ok_or_else(|| InspectError::ProcessNotFound(name.to_string()))
}

/// On-disk image of the first process whose `comm` equals `name`, via its
/// `exe` link.
pub fn image_path(name: &str) -> InspectResult<PathBuf> {
    let pid = pid_by_name(name)?;
    let path = fs::read_link(format!("/proc/{pid}/exe"))?;
    debug!("{name} (pid {pid}) runs {}", path.display());
    Ok(path)
}

/// Open the image a named process is running.
pub fn open_image(name: &str) -> InspectResult<ElfImage> {
    ElfImage::open(image_path(name)?)
}

/// Disassemble a named function of `image` with all cross-references
/// resolved against its symbol tables and embedded strings.
pub fn function_assembly(
    image: &ElfImage,
    disassembler: &Disassembler,
    function_name: &str,
) -> InspectResult<Vec<InstructionLine>> {
    let function = image.function(function_name)?;
    disassembler.disassemble(
        &function.opcodes,
        function.address,
        image.static_symbols(),
        image.dynamic_symbols(),
        image.strings(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_comm() -> String {
        fs::read_to_string("/proc/self/comm")
            .unwrap()
            .trim_end_matches('\n')
            .to_string()
    }

    #[test]
    fn test_running_processes_include_us() {
        let processes = running_processes().unwrap();
        assert!(processes.contains(&own_comm()));
    }

    #[test]
    fn test_pid_by_name_finds_matching_comm() {
        let name = own_comm();
        let pid = pid_by_name(&name).unwrap();
        assert_eq!(comm(pid).as_deref(), Some(name.as_str()));
    }

    #[test]
    fn test_pid_by_name_unknown() {
        assert!(matches!(
            pid_by_name("no-such-process-here"),
            Err(InspectError::ProcessNotFound(_))
        ));
    }

    #[test]
    fn test_image_path_is_absolute() {
        let path = image_path(&own_comm()).unwrap();
        assert!(path.is_absolute());
    }

    #[test]
    fn test_function_assembly_for_main() {
        let image = ElfImage::open(std::env::current_exe().unwrap()).unwrap();
        let disassembler = Disassembler::new().unwrap();

        let lines = function_assembly(&image, &disassembler, "main").unwrap();
        assert!(!lines.is_empty());

        let main = image.function("main").unwrap();
        let decoded: usize = lines.iter().map(|l| l.opcodes.len()).sum();
        assert_eq!(decoded as u64, main.size);
    }
}
