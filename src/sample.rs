//! A minimal arm64 guest for smoke-testing a VM
//!
//! Computes `(2 + 2) - 1`, stores the result at the address in `x1`, then
//! requests a PSCI system reset through `hvc #0`.

/// Guest-physical base the sample is loaded at
pub const MEM_BASE: u64 = 0x6942_0000;

/// Guest RAM size used with the sample
pub const MEM_SIZE: usize = 0x10_0000;

/// Offset into guest RAM that receives the result
pub const RESULT_OFFSET: u64 = 0x100;

/// Value the sample stores
pub const EXPECTED_RESULT: u64 = 3;

#[rustfmt::skip]
pub const ARITH_GUEST: [u8; 32] = [
    0x40, 0x00, 0x80, 0xd2, // mov  x0, #2
    0x00, 0x08, 0x00, 0x91, // add  x0, x0, #2
    0x00, 0x04, 0x00, 0xd1, // sub  x0, x0, #1
    0x20, 0x00, 0x00, 0xf9, // str  x0, [x1]
    0x20, 0x01, 0x80, 0xd2, // mov  x0, #0x9
    0x00, 0x80, 0xb0, 0xf2, // movk x0, #0x8400, lsl #16 (PSCI SYSTEM_RESET)
    0x02, 0x00, 0x00, 0xd4, // hvc  #0
    0x00, 0x00, 0x00, 0x14, // b    .
];

/// Guest-physical address of the result when loaded at [`MEM_BASE`]
pub const fn result_addr() -> u64 {
    MEM_BASE + RESULT_OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_words() {
        let words: Vec<u32> = ARITH_GUEST
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        assert_eq!(words[0], 0xd280_0040);
        assert_eq!(words[6], 0xd400_0002);
        assert_eq!(words[7], 0x1400_0000);
        assert_eq!(result_addr(), 0x6942_0100);
    }
}
