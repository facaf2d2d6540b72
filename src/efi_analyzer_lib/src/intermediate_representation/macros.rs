/// Creates an `Instruction` specified by a string slice of the form `address: mnemonic operands`.
///
/// The operand syntax follows the Intel syntax for x86 and the usual assembler syntax for AArch64.
/// Size prefixes like `qword ptr` set the access size of memory operands.
/// Numeric operands of branches, calls and `adr`/`adrp` become addresses, all other numbers immediates.
/// The instruction size is set to 4.
///
/// ## Panics
///- string must contain `:` after the address
///- address and numbers must be decimal or hexadecimal with `0x` prefix
///
/// ## Example
/// ```rust
///     use efi_analyzer_lib::intermediate_representation::*;
///     use efi_analyzer_lib::insn;
///
///     let instruction = insn!("0x1000: mov rax, qword ptr [rdx+0x60]");
///     assert_eq!(instruction.address, 0x1000);
///     assert_eq!(instruction.mnemonic, Mnemonic::Mov);
///     assert_eq!(
///         instruction.operands[1],
///         Operand::Memory(MemoryOperand::based("rdx", 0x60).with_size(8))
///     );
/// ```
#[macro_export]
macro_rules! insn {
    (  $x:literal  ) => {{
        $crate::intermediate_representation::parsing::parse_instruction($x)
    }};
}

/// Creates a `Vec<Instruction>` specified by the string slices. Utilizes the `insn!` syntax.
///
/// The size of each instruction is derived from the address of the following instruction,
/// the last instruction gets size 4.
///
/// ## Example
/// ```rust
///     use efi_analyzer_lib::intermediate_representation::*;
///     use efi_analyzer_lib::insns;
///
///     let instructions = insns!["0x1000: push rbp", "0x1001: mov rbp, rsp", "0x1004: ret"];
///     assert_eq!(instructions[0].size, 1);
///     assert_eq!(instructions[1].size, 3);
///     assert_eq!(instructions[2].size, 4);
/// ```
#[macro_export]
macro_rules! insns {
    [$($x:literal),* $(,)?] => {{
        $crate::intermediate_representation::parsing::parse_instructions(&[$($x),*])
    }};
}

pub mod parsing {
    //! Provides parsing functions for the macros defined in `macros.rs`
    //! This module hides the parsing functions and allows exposure of the macros only.
    use crate::intermediate_representation::{Instruction, MemoryOperand, Mnemonic, Operand, Register};
    use regex::Regex;

    /// Parses a sequence of instructions and derives the instruction sizes from consecutive addresses.
    ///
    /// This is used for the `insns!` macro, consider the macro documentation for more details.
    #[allow(dead_code)]
    pub fn parse_instructions(lines: &[&str]) -> Vec<Instruction> {
        let mut instructions: Vec<Instruction> = lines.iter().map(|line| parse_instruction(line)).collect();
        for index in 1..instructions.len() {
            let next_address = instructions[index].address;
            let previous = &mut instructions[index - 1];
            if next_address > previous.address {
                previous.size = next_address - previous.address;
            }
        }
        instructions
    }

    /// Parses an instruction defining string slice and returns its corresponding `Instruction`.
    ///
    /// This is used for the `insn!` macro, consider the macro documentation for more details.
    #[allow(dead_code)]
    pub fn parse_instruction(str: &str) -> Instruction {
        let regex = Regex::new(r"^\s*(0x[[:xdigit:]]+|[0-9]+)\s*:\s*([[:alpha:]][[:alnum:].]*)\s*(.*)$").unwrap();
        let captures = regex
            .captures(str)
            .unwrap_or_else(|| panic!("Could not parse instruction: {}", str));
        let address = parse_number(&captures[1]);
        let mnemonic = Mnemonic::from(&captures[2]);
        let is_address_operand = mnemonic.is_call()
            || mnemonic.is_conditional_branch()
            || mnemonic.is_unconditional_jump()
            || matches!(mnemonic, Mnemonic::Adr | Mnemonic::Adrp);
        let operands = split_operands(captures[3].trim())
            .into_iter()
            .map(|operand| parse_operand(operand, is_address_operand))
            .collect();
        Instruction::new(address, 4, mnemonic, operands)
    }

    /// Split an operand list at the commas outside of brackets.
    fn split_operands(str: &str) -> Vec<&str> {
        let mut operands = Vec::new();
        let mut depth = 0;
        let mut start = 0;
        for (index, character) in str.char_indices() {
            match character {
                '[' => depth += 1,
                ']' => depth -= 1,
                ',' if depth == 0 => {
                    operands.push(str[start..index].trim());
                    start = index + 1;
                }
                _ => (),
            }
        }
        if !str[start..].trim().is_empty() {
            operands.push(str[start..].trim());
        }
        operands
    }

    /// Parses a single operand.
    fn parse_operand(str: &str, is_address_operand: bool) -> Operand {
        let mut str = str.trim();
        let mut size = 0;
        for (prefix, prefix_size) in [("byte", 1), ("word", 2), ("dword", 4), ("qword", 8)] {
            if let Some(rest) = str.strip_prefix(prefix) {
                if rest.starts_with(char::is_whitespace) || rest.starts_with('[') {
                    size = prefix_size;
                    str = rest.trim_start();
                    str = str.strip_prefix("ptr").unwrap_or(str).trim_start();
                }
            }
        }
        if str.starts_with('[') {
            return Operand::Memory(parse_memory_operand(str, size));
        }
        let number = str.strip_prefix('#').unwrap_or(str);
        if number.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
            let value = parse_number(number);
            if is_address_operand {
                Operand::Address(value)
            } else {
                Operand::Immediate(value)
            }
        } else {
            Operand::Register(Register::new(str))
        }
    }

    /// Parses `[base + index*scale + displacement]` (x86) or `[base, #displacement]!` (AArch64).
    fn parse_memory_operand(str: &str, size: u8) -> MemoryOperand {
        let writeback = str.ends_with('!');
        let inner = str
            .trim_end_matches('!')
            .trim_start_matches('[')
            .trim_end_matches(']');
        let mut memory = MemoryOperand {
            size,
            writeback,
            ..Default::default()
        };
        if inner.contains(',') {
            for (position, part) in inner.split(',').map(str::trim).enumerate() {
                if position == 0 {
                    memory.base = Some(Register::new(part));
                } else if part.starts_with('#') {
                    memory.displacement = parse_number(&part[1..]) as i64;
                } else {
                    memory.index = Some(Register::new(part));
                    memory.scale = 1;
                }
            }
            return memory;
        }
        let term_regex = Regex::new(r"([+-]?)\s*([[:alnum:]*]+)").unwrap();
        for captures in term_regex.captures_iter(inner) {
            let negative = &captures[1] == "-";
            let term = &captures[2];
            if term.starts_with(|c: char| c.is_ascii_digit()) {
                let value = parse_number(term) as i64;
                let value = if negative { value.wrapping_neg() } else { value };
                memory.displacement = memory.displacement.wrapping_add(value);
            } else if let Some((register, scale)) = term.split_once('*') {
                memory.index = Some(Register::new(register));
                memory.scale = scale.parse().unwrap();
            } else if memory.base.is_none() {
                memory.base = Some(Register::new(term));
            } else {
                memory.index = Some(Register::new(term));
                memory.scale = 1;
            }
        }
        memory
    }

    /// Parses a decimal or hexadecimal number. Negative numbers are converted to their two's complement.
    fn parse_number(str: &str) -> u64 {
        let (negative, digits) = match str.strip_prefix('-') {
            Some(digits) => (true, digits),
            None => (false, str),
        };
        let value = match digits.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => digits.parse(),
        }
        .unwrap_or_else(|_| panic!("Could not parse number: {}", str));
        if negative {
            value.wrapping_neg()
        } else {
            value
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::intermediate_representation::*;

    #[test]
    fn x86_operands() {
        let instruction = insn!("0x1000: mov dword ptr [rsp+rcx*4-0x8], 0x12345678");
        assert_eq!(
            instruction.operands,
            vec![
                Operand::Memory(MemoryOperand {
                    base: Some(Register::new("rsp")),
                    index: Some(Register::new("rcx")),
                    scale: 4,
                    displacement: -8,
                    size: 4,
                    writeback: false,
                }),
                Operand::Immediate(0x12345678),
            ]
        );
        let call = insn!("0x1010: call 0x2000");
        assert_eq!(call.operands, vec![Operand::Address(0x2000)]);
        assert_eq!(call.branch_target(), Some(0x2000));
        let absolute = insn!("0x1020: mov eax, [0x4000]");
        assert_eq!(
            absolute.operands[1],
            Operand::Memory(MemoryOperand::absolute(0x4000))
        );
    }

    #[test]
    fn aarch64_operands() {
        let instruction = insn!("0x1000: stp x29, x30, [sp, #-0x10]!");
        assert_eq!(
            instruction.operands[2],
            Operand::Memory(MemoryOperand {
                writeback: true,
                ..MemoryOperand::based("sp", -0x10)
            })
        );
        let adrp = insn!("0x1004: adrp x8, 0x5000");
        assert_eq!(adrp.operands[1], Operand::Address(0x5000));
        let add = insn!("0x1008: add x8, x8, #0x20");
        assert_eq!(add.operands[2], Operand::Immediate(0x20));
        let branch = insn!("0x100c: b.hi 0x1100");
        assert_eq!(branch.mnemonic, Mnemonic::BCond("b.hi".to_string()));
        assert_eq!(branch.branch_target(), Some(0x1100));
    }

    #[test]
    fn instruction_sizes() {
        let instructions = insns![
            "0x1000: push rbp",
            "0x1001: mov rbp, rsp",
            "0x1004: ret",
        ];
        assert_eq!(instructions[0].size, 1);
        assert_eq!(instructions[1].size, 3);
        assert_eq!(instructions[2].next_address(), 0x1008);
    }
}
