//! The symbols module contains the assembler-symbol set derived from the
//! memory map, and the generated C header through which compiled programs
//! address the mapped peripherals.

use crate::memmap::MemoryMapEntry;
use crate::periph::Peripheral;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// An absolute address in the shared address space.
    Address,
    /// A plain constant (sizes, offsets, device geometry).
    Constant,
}

/// A named constant handed to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
}

impl Symbol {
    fn address(name: String) -> Self {
        Symbol {
            name,
            kind: SymbolKind::Address,
        }
    }

    fn constant(name: String) -> Self {
        Symbol {
            name,
            kind: SymbolKind::Constant,
        }
    }
}

/// Turn a peripheral instance name into a C identifier.
pub(crate) fn c_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_alphanumeric() {
            if i == 0 && c.is_ascii_digit() {
                out.push('_');
            }
            out.push(c.to_ascii_uppercase());
        } else {
            out.push('_');
        }
    }
    out
}

/// The symbols a single mapped peripheral contributes: its base address
/// and size, an offset and an absolute address per exported register, and
/// any device-declared extras.
pub(crate) fn symbols_for_peripheral(
    periph_name: &str,
    mapping: &MemoryMapEntry,
    dev: &dyn Peripheral,
) -> Vec<(Symbol, u64)> {
    let mut symbols = Vec::new();
    symbols.push((
        Symbol::address(format!("{}_BASE", periph_name)),
        mapping.base,
    ));
    symbols.push((
        Symbol::constant(format!("{}_SIZE", periph_name)),
        mapping.size,
    ));

    for reg in dev.registers() {
        if reg.exported {
            let reg_name = c_name(reg.name);
            symbols.push((
                Symbol::constant(format!("{}_{}_OFFSET", periph_name, reg_name)),
                reg.offset,
            ));
            symbols.push((
                Symbol::address(format!("{}_{}", periph_name, reg_name)),
                mapping.base + reg.offset,
            ));
        }
    }

    for extra in dev.extra_symbols() {
        symbols.push((
            Symbol::constant(format!("{}_{}", periph_name, c_name(extra.name))),
            extra.value,
        ));
    }

    symbols
}

/// Render the per-peripheral symbol groups as a C header.
pub(crate) fn header_text(groups: &[(String, Vec<(Symbol, u64)>)]) -> String {
    let mut lines = Vec::new();
    lines.push("#ifndef RVEMU_IO_HEADER".to_string());
    lines.push("#define RVEMU_IO_HEADER".to_string());
    for (periph_name, symbols) in groups {
        let banner =
            "// *****************************************************************************";
        lines.push(banner.to_string());
        lines.push(format!("// * {}", periph_name));
        lines.push(banner.to_string());
        for (symbol, value) in symbols {
            lines.push(format!("#define {}\t(0x{:x})", symbol.name, value));
        }
        lines.push(String::new());
    }
    lines.push("#endif // RVEMU_IO_HEADER".to_string());
    lines.join("\n")
}
