use std::sync::atomic::{AtomicU32, Ordering};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// The only mutable state shared across requests: the confidence threshold,
/// stored as the bit pattern of an `f32` in `[0, 1]`. Configure writes it
/// atomically; each Detect call reads one snapshot, so a concurrent update
/// is observed either entirely before or entirely after a given call.
#[derive(Debug)]
pub struct ServiceState {
    threshold_bits: AtomicU32,
}

impl ServiceState {
    pub fn new(confidence_threshold: f32) -> Self {
        Self {
            threshold_bits: AtomicU32::new(clamp_threshold(confidence_threshold).to_bits()),
        }
    }

    pub fn confidence_threshold(&self) -> f32 {
        f32::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }

    /// Clamps into `[0, 1]`, stores, and returns the applied value. Callers
    /// must have already rejected non-finite input.
    pub fn set_confidence_threshold(&self, value: f32) -> f32 {
        let clamped = clamp_threshold(value);
        self.threshold_bits
            .store(clamped.to_bits(), Ordering::Relaxed);
        clamped
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

fn clamp_threshold(value: f32) -> f32 {
    value.clamp(0., 1.)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_threshold() {
        assert_eq!(ServiceState::default().confidence_threshold(), 0.5);
    }

    #[test]
    fn test_set_clamps_out_of_range_values() {
        let state = ServiceState::default();

        assert_eq!(state.set_confidence_threshold(1.5), 1.0);
        assert_eq!(state.confidence_threshold(), 1.0);

        assert_eq!(state.set_confidence_threshold(-0.2), 0.0);
        assert_eq!(state.confidence_threshold(), 0.0);
    }

    #[test]
    fn test_in_range_value_is_stored_exactly() {
        let state = ServiceState::default();

        assert_eq!(state.set_confidence_threshold(0.75), 0.75);
        assert_eq!(state.confidence_threshold(), 0.75);
    }
}
