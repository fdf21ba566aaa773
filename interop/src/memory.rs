//! Memory-type selection

/// Index of the first memory type allowed by `allowed_types` (one bit per
/// type) whose property flags contain `required`.
pub fn select_memory_type(allowed_types: u32, type_flags: &[u32], required: u32) -> Option<u32> {
    type_flags
        .iter()
        .take(32)
        .enumerate()
        .find(|&(i, &flags)| allowed_types & (1 << i) != 0 && flags & required == required)
        .map(|(i, _)| i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_LOCAL: u32 = 0x1;
    const HOST_VISIBLE: u32 = 0x2;
    const HOST_COHERENT: u32 = 0x4;

    #[test]
    fn test_first_allowed_match_wins() {
        let types = [DEVICE_LOCAL, HOST_VISIBLE | HOST_COHERENT, DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT];
        assert_eq!(select_memory_type(0b111, &types, DEVICE_LOCAL), Some(0));
        assert_eq!(select_memory_type(0b110, &types, DEVICE_LOCAL), Some(2));
        assert_eq!(select_memory_type(0b111, &types, HOST_VISIBLE | HOST_COHERENT), Some(1));
    }

    #[test]
    fn test_no_match() {
        let types = [DEVICE_LOCAL, HOST_VISIBLE];
        assert_eq!(select_memory_type(0b01, &types, HOST_VISIBLE), None);
        assert_eq!(select_memory_type(0, &types, 0), None);
    }
}
