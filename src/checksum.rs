/// XOR of every byte, as used by the STK500v2 frame trailer.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &byte| acc ^ byte)
}

/// Intel-HEX line checksum: two's complement of the byte sum, mod 256.
///
/// Appending the result to `data` makes the whole line sum to zero.
pub fn hex_line_checksum(data: &[u8]) -> u8 {
    byte_sum(data).wrapping_neg()
}

/// Sum of every byte, mod 256.
pub fn byte_sum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &byte| acc.wrapping_add(byte))
}
