use bitflags::bitflags;

bitflags! {
    /// Vector-instruction tiers of the running CPU, widest bit wins.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SimdMask: u32 {
        const SSE2   = 0x0001;
        const SSE3   = 0x0002;
        const SSSE3  = 0x0004;
        const SSE41  = 0x0008;
        const SSE42  = 0x0010;
        const POPCNT = 0x0020;
        const AVX    = 0x0040;
        const AVX2   = 0x0080;
    }
}

impl SimdMask {
    /// Probes the running CPU. Non-x86 targets report `empty()`, which routes
    /// every conversion through the scalar path.
    pub fn available() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            let mut mask = SimdMask::empty();
            if is_x86_feature_detected!("sse2") {
                mask |= SimdMask::SSE2;
            }
            if is_x86_feature_detected!("sse3") {
                mask |= SimdMask::SSE3;
            }
            if is_x86_feature_detected!("ssse3") {
                mask |= SimdMask::SSSE3;
            }
            if is_x86_feature_detected!("sse4.1") {
                mask |= SimdMask::SSE41;
            }
            if is_x86_feature_detected!("sse4.2") {
                mask |= SimdMask::SSE42;
            }
            if is_x86_feature_detected!("popcnt") {
                mask |= SimdMask::POPCNT;
            }
            if is_x86_feature_detected!("avx") {
                mask |= SimdMask::AVX;
            }
            if is_x86_feature_detected!("avx2") {
                mask |= SimdMask::AVX2;
            }
            mask
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        {
            SimdMask::empty()
        }
    }

    pub fn widest_name(self) -> &'static str {
        if self.contains(SimdMask::AVX2) {
            "avx2"
        } else if self.contains(SimdMask::AVX) {
            "avx"
        } else if self.contains(SimdMask::SSE42) {
            "sse4.2"
        } else if self.contains(SimdMask::SSE41) {
            "sse4.1"
        } else if self.contains(SimdMask::SSSE3) {
            "ssse3"
        } else if self.contains(SimdMask::SSE2) {
            "sse2"
        } else {
            "none"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widest_name_follows_ladder() {
        assert_eq!(SimdMask::empty().widest_name(), "none");
        assert_eq!(SimdMask::SSE2.widest_name(), "sse2");
        assert_eq!((SimdMask::SSE2 | SimdMask::AVX2).widest_name(), "avx2");
        assert_eq!((SimdMask::SSE2 | SimdMask::SSE41).widest_name(), "sse4.1");
    }

    #[test]
    fn detection_is_consistent() {
        let mask = SimdMask::available();
        // A CPU reporting AVX2 always reports the narrower tiers too.
        if mask.contains(SimdMask::AVX2) {
            assert!(mask.contains(SimdMask::SSE2));
        }
    }
}
