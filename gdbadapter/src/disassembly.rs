/// Disassembly windows
///
/// Builds fixed-length instruction windows around a memory reference from
/// `-data-disassemble` calls, padding with placeholders when memory cannot
/// be read.

use std::collections::HashSet;

use crate::backend::GdbBackend;
use crate::commands::AsmInstruction;
use crate::memory::calculate_memory_offset;
use crate::{GdbError, Result};

const MEAN_INSTRUCTION_SIZE: i64 = 4;
const PLACEHOLDER_STRIDE: i64 = 2;
const MAX_FETCHES: usize = 32;
/// Largest window a single request may ask for
pub const MAX_INSTRUCTIONS: u64 = 65_536;
const RESERVE_LIMIT: usize = 1024;

pub const FAILED_INSTRUCTION: &str = "failed to retrieve instruction";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DisassembledInstruction {
    pub address: String,
    pub instruction_bytes: Option<String>,
    pub instruction: String,
    pub symbol: Option<String>,
    /// Full path of the source file
    pub location: Option<String>,
    pub line: Option<u32>,
    /// `invalid` for placeholders
    pub presentation_hint: Option<String>,
}

impl DisassembledInstruction {
    fn from_asm(asm: &AsmInstruction) -> Self {
        let symbol = asm.func_name.as_ref().map(|name| match asm.offset {
            Some(offset) => format!("{}+{}", name, offset),
            None => name.clone(),
        });
        Self {
            address: asm.address.clone(),
            instruction_bytes: asm.opcodes.clone(),
            instruction: asm.inst.clone(),
            symbol,
            location: asm.fullname.clone(),
            line: asm.line,
            presentation_hint: None,
        }
    }

    fn label(asm: &AsmInstruction, name: &str) -> Self {
        Self {
            address: asm.address.clone(),
            instruction: format!("<{}>:", name),
            symbol: Some(name.to_string()),
            location: asm.fullname.clone(),
            line: asm.line,
            ..Default::default()
        }
    }

    /// Function name when this is a `<name>:` label
    fn label_name(&self) -> Option<&str> {
        let name = self.instruction.strip_prefix('<')?.strip_suffix(">:")?;
        (self.symbol.as_deref() == Some(name)).then_some(name)
    }

    fn placeholder(address: String) -> Self {
        Self {
            address,
            instruction: FAILED_INSTRUCTION.to_string(),
            presentation_hint: Some("invalid".to_string()),
            ..Default::default()
        }
    }
}

/// Functions that already got a label in this session
#[derive(Debug, Default)]
pub struct FunctionLabelCache {
    labeled: HashSet<String>,
}

impl FunctionLabelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_labeled(&self, name: &str) -> bool {
        self.labeled.contains(name)
    }

    /// Remember the functions whose labels made it into a returned window
    fn record(&mut self, window: &[DisassembledInstruction]) {
        for name in window.iter().filter_map(DisassembledInstruction::label_name) {
            self.labeled.insert(name.to_string());
        }
    }

    pub fn clear(&mut self) {
        self.labeled.clear();
    }
}

async fn fetch_range(
    backend: &GdbBackend,
    labels: &FunctionLabelCache,
    offered: &mut HashSet<String>,
    reference: &str,
    lower: i64,
    upper: i64,
) -> Result<Vec<DisassembledInstruction>> {
    let bound = |offset: i64| format!("({})+{}", reference, offset);
    let asm = backend.data_disassemble(&bound(lower), &bound(upper)).await?;

    let mut out = Vec::with_capacity(asm.len());
    for insn in &asm {
        if let (Some(name), Some(0)) = (&insn.func_name, insn.offset) {
            if !labels.is_labeled(name) && offered.insert(name.clone()) {
                out.push(DisassembledInstruction::label(insn, name));
            }
        }
        out.push(DisassembledInstruction::from_asm(insn));
    }
    Ok(out)
}

fn placeholders(edge_address: &str, count: usize, stride: i64) -> Result<Vec<DisassembledInstruction>> {
    let mut out = Vec::with_capacity(count.min(RESERVE_LIMIT));
    let mut address = edge_address.to_string();
    for _ in 0..count {
        address = calculate_memory_offset(&address, stride)?;
        out.push(DisassembledInstruction::placeholder(address.clone()));
    }
    if stride < 0 {
        out.reverse();
    }
    Ok(out)
}

fn window_size(count: u64) -> Result<usize> {
    if count > MAX_INSTRUCTIONS {
        return Err(GdbError::InvalidInput(format!(
            "Cannot disassemble {} instructions at once (limit {})",
            count, MAX_INSTRUCTIONS
        )));
    }
    Ok(count as usize)
}

fn range_overflow() -> GdbError {
    GdbError::InvalidInput("Disassembly range out of bounds".to_string())
}

/// Builds the window without touching the label cache
async fn collect_instructions(
    backend: &GdbBackend,
    labels: &FunctionLabelCache,
    reference: &str,
    length: i64,
) -> Result<Vec<DisassembledInstruction>> {
    let wanted = window_size(length.unsigned_abs())?;
    let backwards = length < 0;
    let mut offered = HashSet::new();
    let mut list: Vec<DisassembledInstruction> = Vec::with_capacity(wanted.min(RESERVE_LIMIT));
    let (mut lower, mut upper) = (0i64, 0i64);

    for _ in 0..MAX_FETCHES {
        if list.len() >= wanted {
            break;
        }
        let remaining = (wanted - list.len()) as i64;
        let span = remaining
            .checked_mul(MEAN_INSTRUCTION_SIZE)
            .ok_or_else(range_overflow)?;
        if backwards {
            upper = lower;
            lower = upper.checked_sub(span).ok_or_else(range_overflow)?;
        } else {
            lower = upper;
            upper = lower.checked_add(span).ok_or_else(range_overflow)?;
        }

        match fetch_range(backend, labels, &mut offered, reference, lower, upper).await {
            Ok(batch) if batch.is_empty() => break,
            Ok(batch) => {
                if backwards {
                    list.splice(0..0, batch);
                } else {
                    list.extend(batch);
                }
            }
            Err(e) if list.is_empty() => return Err(e),
            Err(e) => {
                log::debug!("Disassembly stopped early: {}", e);
                break;
            }
        }
    }

    if list.len() < wanted {
        let edge = if backwards { list.first() } else { list.last() };
        let Some(edge) = edge else {
            return Err(GdbError::CommandError("Cannot retrieve instructions!".to_string()));
        };
        let stride = if backwards { -PLACEHOLDER_STRIDE } else { PLACEHOLDER_STRIDE };
        let padding = placeholders(&edge.address, wanted - list.len(), stride)?;
        if backwards {
            list.splice(0..0, padding);
        } else {
            list.extend(padding);
        }
    }

    if backwards {
        let surplus = list.len() - wanted;
        list.drain(..surplus);
    } else {
        list.truncate(wanted);
    }
    Ok(list)
}

/// Exactly `|length|` instructions starting at `reference`, or ending just
/// before it when `length` is negative.
pub async fn get_instructions(
    backend: &GdbBackend,
    labels: &mut FunctionLabelCache,
    reference: &str,
    length: i64,
) -> Result<Vec<DisassembledInstruction>> {
    let list = collect_instructions(backend, labels, reference, length).await?;
    labels.record(&list);
    Ok(list)
}

/// Instructions for a `disassemble` request: the window covers
/// `[instruction_offset, instruction_offset + instruction_count)` in
/// instructions relative to `reference`.
pub async fn disassemble_window(
    backend: &GdbBackend,
    labels: &mut FunctionLabelCache,
    reference: &str,
    instruction_offset: i64,
    instruction_count: i64,
) -> Result<Vec<DisassembledInstruction>> {
    if instruction_count <= 0 {
        return Ok(Vec::new());
    }
    window_size(instruction_offset.unsigned_abs().saturating_add(instruction_count.unsigned_abs()))?;
    let count = instruction_count as usize;

    let mut instructions = Vec::with_capacity(count.min(RESERVE_LIMIT));
    if instruction_offset < 0 {
        let before = collect_instructions(backend, labels, reference, instruction_offset).await?;
        instructions.extend(before.into_iter().take(count));
    }

    let remaining = count - instructions.len();
    if remaining > 0 {
        let skip = instruction_offset.max(0) as usize;
        let after = collect_instructions(backend, labels, reference, (remaining + skip) as i64).await?;
        instructions.extend(after.into_iter().skip(skip));
    }

    labels.record(&instructions);
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_forward() {
        let padding = placeholders("0x1000", 3, 2).unwrap();
        let addresses: Vec<_> = padding.iter().map(|i| i.address.as_str()).collect();
        assert_eq!(addresses, vec!["0x1002", "0x1004", "0x1006"]);
        assert!(padding
            .iter()
            .all(|i| i.instruction == FAILED_INSTRUCTION && i.presentation_hint.as_deref() == Some("invalid")));
    }

    #[test]
    fn test_placeholders_backward_are_ascending() {
        let padding = placeholders("0x1000", 2, -2).unwrap();
        let addresses: Vec<_> = padding.iter().map(|i| i.address.as_str()).collect();
        assert_eq!(addresses, vec!["0x0ffc", "0x0ffe"]);
    }

    #[test]
    fn test_label_cache_records_only_labels() {
        let asm = AsmInstruction {
            address: "0x1000".to_string(),
            func_name: Some("main".to_string()),
            offset: Some(0),
            ..Default::default()
        };
        let window = vec![
            DisassembledInstruction::label(&asm, "main"),
            DisassembledInstruction::from_asm(&asm),
            DisassembledInstruction::placeholder("0x1002".to_string()),
        ];

        let mut cache = FunctionLabelCache::new();
        cache.record(&window[1..]);
        assert!(!cache.is_labeled("main"));
        cache.record(&window);
        assert!(cache.is_labeled("main"));
        cache.clear();
        assert!(!cache.is_labeled("main"));
    }

    #[test]
    fn test_oversized_window_is_rejected() {
        assert_eq!(window_size(16).unwrap(), 16);
        assert!(matches!(window_size(u64::MAX), Err(GdbError::InvalidInput(_))));
    }

    #[test]
    fn test_symbol_includes_offset() {
        let asm = AsmInstruction {
            address: "0x1004".to_string(),
            func_name: Some("main".to_string()),
            offset: Some(4),
            opcodes: Some("48 89 e5".to_string()),
            inst: "mov %rsp,%rbp".to_string(),
            file: None,
            fullname: None,
            line: None,
        };
        let insn = DisassembledInstruction::from_asm(&asm);
        assert_eq!(insn.symbol.as_deref(), Some("main+4"));
        assert_eq!(insn.instruction_bytes.as_deref(), Some("48 89 e5"));
    }
}
