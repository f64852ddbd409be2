pub fn aligned_size(value: u32, alignment: u32) -> u32 {
    assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_alignment() {
        assert_eq!(aligned_size(0, 16), 0);
        assert_eq!(aligned_size(1, 16), 16);
        assert_eq!(aligned_size(32, 32), 32);
        assert_eq!(align_up(49, 16), 64);
        assert_eq!(align_up(48, 16), 48);
    }
}
