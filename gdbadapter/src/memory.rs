/// Memory payload codecs and address arithmetic
///
/// GDB exchanges memory contents as hex digits, DAP clients as base64.

use base64::prelude::*;
use regex::Regex;
use std::sync::OnceLock;

use crate::{GdbError, Result};

/// Convert GDB hex contents to base64
pub fn hex_to_base64(hex: &str) -> Result<String> {
    if hex.len() % 2 != 0 {
        return Err(GdbError::InvalidInput(
            "Received memory with incomplete bytes.".to_string(),
        ));
    }
    let ill_formed = || GdbError::InvalidInput(format!("Received ill-formed hex input: {}", hex));

    let bytes = hex
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let digits = std::str::from_utf8(pair).map_err(|_| ill_formed())?;
            u8::from_str_radix(digits, 16).map_err(|_| ill_formed())
        })
        .collect::<Result<Vec<u8>>>()?;

    Ok(BASE64_STANDARD.encode(bytes))
}

/// Convert base64 from a client to lower-case hex; the input must round-trip exactly
pub fn base64_to_hex(base64: &str) -> Result<String> {
    let ill_formed = || GdbError::InvalidInput(format!("Received ill-formed base64 input: {}", base64));

    let bytes = BASE64_STANDARD.decode(base64).map_err(|_| ill_formed())?;
    if BASE64_STANDARD.encode(&bytes) != base64 {
        return Err(ill_formed());
    }
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Apply a byte offset to a memory reference.
///
/// Hex addresses keep their digit count; symbolic references fold the
/// offset into a trailing `+N`/`-N`.
pub fn calculate_memory_offset(reference: &str, offset: i64) -> Result<String> {
    if let Some(digits) = reference.strip_prefix("0x") {
        let width = digits.len();
        let base = i128::from_str_radix(digits, 16)
            .map_err(|_| GdbError::InvalidInput(format!("Invalid memory reference: {}", reference)))?;
        let address = base + offset as i128;
        if address < 0 {
            return Ok(format!("(0x{})-{}", "0".repeat(width), -address));
        }
        return Ok(format!("0x{:0width$x}", address, width = width));
    }

    static SYMBOLIC: OnceLock<Regex> = OnceLock::new();
    let symbolic = SYMBOLIC.get_or_init(|| Regex::new(r"^([^+-]*)([+-]\d+)?$").expect("valid regex"));
    let caps = symbolic
        .captures(reference)
        .ok_or_else(|| GdbError::InvalidInput(format!("Invalid memory reference: {}", reference)))?;
    let symbol = caps.get(1).map_or("", |m| m.as_str());
    let existing: i64 = match caps.get(2) {
        Some(m) => m
            .as_str()
            .parse()
            .map_err(|_| GdbError::InvalidInput(format!("Invalid memory reference: {}", reference)))?,
        None => 0,
    };

    let total = existing + offset;
    Ok(match total {
        0 => symbol.to_string(),
        n if n < 0 => format!("{}{}", symbol, n),
        n => format!("{}+{}", symbol, n),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_to_base64() {
        assert_eq!(hex_to_base64("").unwrap(), "");
        assert_eq!(hex_to_base64("48656c6c6f").unwrap(), "SGVsbG8=");
        assert_eq!(hex_to_base64("DEADBEEF").unwrap(), "3q2+7w==");
    }

    #[test]
    fn test_hex_rejects_malformed() {
        let err = hex_to_base64("abc").unwrap_err();
        assert!(err.to_string().contains("incomplete bytes"));
        let err = hex_to_base64("zz").unwrap_err();
        assert!(err.to_string().contains("ill-formed hex"));
    }

    #[test]
    fn test_base64_to_hex() {
        assert_eq!(base64_to_hex("SGVsbG8=").unwrap(), "48656c6c6f");
        assert_eq!(base64_to_hex("3q2+7w==").unwrap(), "deadbeef");
    }

    #[test]
    fn test_base64_rejects_dangling_bits() {
        // "SGVsbG9=" decodes to the same bytes as "SGVsbG8=" with non-zero padding bits
        assert!(base64_to_hex("SGVsbG9=").is_err());
        assert!(base64_to_hex("SGVsbG8").is_err());
        assert!(base64_to_hex("not base64!").is_err());
    }

    #[test]
    fn test_codecs_compose() {
        for hex in ["", "00", "0102ff", "cafebabe00"] {
            assert_eq!(base64_to_hex(&hex_to_base64(hex).unwrap()).unwrap(), hex);
        }
        for b64 in ["AA==", "AQL/", "yv66vgA="] {
            assert_eq!(hex_to_base64(&base64_to_hex(b64).unwrap()).unwrap(), b64);
        }
    }

    #[test]
    fn test_hex_address_offsets() {
        assert_eq!(calculate_memory_offset("0x1000", -16).unwrap(), "0x0ff0");
        assert_eq!(calculate_memory_offset("0x1000", 16).unwrap(), "0x1010");
        assert_eq!(calculate_memory_offset("0xff", 1).unwrap(), "0x100");
        assert_eq!(calculate_memory_offset("0x0010", -32).unwrap(), "(0x0000)-16");
        assert!(calculate_memory_offset("0xnothex", 1).is_err());
    }

    #[test]
    fn test_symbolic_offsets() {
        assert_eq!(calculate_memory_offset("main", 0).unwrap(), "main");
        assert_eq!(calculate_memory_offset("main", 8).unwrap(), "main+8");
        assert_eq!(calculate_memory_offset("main+8", -8).unwrap(), "main");
        assert_eq!(calculate_memory_offset("main+8", -12).unwrap(), "main-4");
        assert_eq!(calculate_memory_offset("&buf-4", 10).unwrap(), "&buf+6");
    }
}
