//! In-memory PE export-directory parsing.
//!
//! Modules inside a captured image exist only in their *mapped* form: headers at the load
//! base, every table addressed by RVA. [`PeExportReader`] reconstructs just enough of a
//! module to resolve named exports: it parses the header page with goblin and then walks
//! the export name/ordinal/function tables directly through the
//! [`AddressSpaceReader`](crate::target::AddressSpaceReader), so nothing beyond the bytes
//! actually touched needs to be resident.

use goblin::pe::header::Header;

use crate::target::{AddressSpaceReader, ExportDirectoryReader, ExportEntry, ModuleInfo, ProcessId};
use crate::{Error, Result};

/// Upper bound on export-name-table entries walked per module.
///
/// Real system DLLs stay well below this; a corrupted count aborts the walk instead of
/// flooding the resolver.
const MAX_NAMED_EXPORTS: u32 = 0x1_0000;

/// Longest export name read before giving up on the string.
const MAX_NAME_LEN: usize = 512;

/// Default [`ExportDirectoryReader`] over a captured address space.
///
/// # Example
///
/// ```rust,no_run
/// use stonegaze::pe::PeExportReader;
/// use stonegaze::target::{AddressSpaceReader, ExportDirectoryReader, ModuleInfo, ProcessId};
///
/// # fn resolve(reader: &dyn AddressSpaceReader) -> stonegaze::Result<()> {
/// let exports = PeExportReader::new(reader);
/// let module = ModuleInfo { name: "KERNEL32.DLL".into(), base: 0x7ff8_0000_0000, size: 0 };
/// for export in exports.exports(ProcessId(4), &module)? {
///     println!("{} -> {:#x}", export.name, export.address);
/// }
/// # Ok(())
/// # }
/// ```
pub struct PeExportReader<'a> {
    reader: &'a dyn AddressSpaceReader,
}

impl<'a> PeExportReader<'a> {
    /// Creates an export reader over the given address space.
    #[must_use]
    pub fn new(reader: &'a dyn AddressSpaceReader) -> Self {
        PeExportReader { reader }
    }

    fn malformed(module: &ModuleInfo, message: impl Into<String>) -> Error {
        Error::MalformedModule {
            module: module.name.clone(),
            message: message.into(),
        }
    }

    /// Reads a NUL-terminated ASCII name at `address`, capped at [`MAX_NAME_LEN`].
    fn read_name(&self, process: ProcessId, address: u64) -> Result<String> {
        let mut name = Vec::new();
        let mut cursor = address;
        // Chunked reads keep the common short-name case to a single access. A chunk
        // may straddle the end of residency even though the terminator sits in the
        // readable part, so a failed chunk retries byte-wise up to the boundary.
        let mut chunk = [0u8; 64];
        while name.len() < MAX_NAME_LEN {
            let readable = match self.reader.read(process, cursor, &mut chunk) {
                Ok(()) => chunk.len(),
                Err(_) => self.read_to_boundary(process, cursor, &mut chunk),
            };
            if let Some(nul) = chunk[..readable].iter().position(|&b| b == 0) {
                name.extend_from_slice(&chunk[..nul]);
                break;
            }
            name.extend_from_slice(&chunk[..readable]);
            if readable < chunk.len() {
                // Residency ended before a terminator did.
                return Err(Error::unreadable(cursor + readable as u64, 1));
            }
            cursor += readable as u64;
        }
        Ok(String::from_utf8_lossy(&name).into_owned())
    }

    /// Fills `chunk` one byte at a time, stopping at the first unreadable byte.
    fn read_to_boundary(&self, process: ProcessId, address: u64, chunk: &mut [u8]) -> usize {
        let mut byte = [0u8];
        for (i, slot) in chunk.iter_mut().enumerate() {
            if self
                .reader
                .read(process, address + i as u64, &mut byte)
                .is_err()
            {
                return i;
            }
            *slot = byte[0];
        }
        chunk.len()
    }
}

impl ExportDirectoryReader for PeExportReader<'_> {
    fn exports(&self, process: ProcessId, module: &ModuleInfo) -> Result<Vec<ExportEntry>> {
        // The header page is always the first page of the mapped image.
        let header_bytes = self.reader.read_vec(process, module.base, 0x1000)?;
        let header = Header::parse(&header_bytes)?;

        let optional = header
            .optional_header
            .ok_or_else(|| Self::malformed(module, "missing optional header"))?;
        let export_dir = optional
            .data_directories
            .get_export_table()
            .ok_or_else(|| Self::malformed(module, "no export data directory"))?;
        if export_dir.virtual_address == 0 || export_dir.size == 0 {
            return Err(Self::malformed(module, "empty export data directory"));
        }

        let dir_base = module.base + u64::from(export_dir.virtual_address);
        let forwarder_range =
            u64::from(export_dir.virtual_address)..u64::from(export_dir.virtual_address) + u64::from(export_dir.size);

        let number_of_names = self.reader.read_u32(process, dir_base + 0x18)?;
        let functions_rva = self.reader.read_u32(process, dir_base + 0x1c)?;
        let names_rva = self.reader.read_u32(process, dir_base + 0x20)?;
        let ordinals_rva = self.reader.read_u32(process, dir_base + 0x24)?;

        if number_of_names > MAX_NAMED_EXPORTS {
            return Err(Self::malformed(
                module,
                format!("implausible export name count {number_of_names}"),
            ));
        }

        let names = module.base + u64::from(names_rva);
        let ordinals = module.base + u64::from(ordinals_rva);
        let functions = module.base + u64::from(functions_rva);

        let mut entries = Vec::with_capacity(number_of_names as usize);
        for i in 0..u64::from(number_of_names) {
            let name_rva = self.reader.read_u32(process, names + i * 4)?;
            let ordinal = {
                let mut buf = [0u8; 2];
                self.reader.read(process, ordinals + i * 2, &mut buf)?;
                u16::from_le_bytes(buf)
            };
            let function_rva = self
                .reader
                .read_u32(process, functions + u64::from(ordinal) * 4)?;

            // A function RVA inside the export directory is a forwarder string, not code.
            if forwarder_range.contains(&u64::from(function_rva)) {
                log::debug!(
                    "skipping forwarded export at ordinal {ordinal} in {}",
                    module.name
                );
                continue;
            }

            let name = self.read_name(process, module.base + u64::from(name_rva))?;
            entries.push(ExportEntry {
                name,
                address: module.base + u64::from(function_rva),
            });
        }

        Ok(entries)
    }
}
