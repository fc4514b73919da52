/// A protocol event serial, ordered with wrap-around awareness.
///
/// Serials are produced by the server and only ever compared against each
/// other, so the comparison inverts once the distance exceeds half the value
/// space.
#[derive(Debug, Default, Clone, Copy)]
pub struct Serial(pub u32);

impl PartialEq for Serial {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Serial {}

impl PartialOrd for Serial {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        let distance = self.0.abs_diff(other.0);
        if distance < u32::MAX / 2 {
            self.0.partial_cmp(&other.0)
        } else {
            // wrap-around occurred, invert comparison
            other.0.partial_cmp(&self.0)
        }
    }
}

impl From<u32> for Serial {
    fn from(n: u32) -> Self {
        Serial(n)
    }
}

impl From<Serial> for u32 {
    fn from(serial: Serial) -> u32 {
        serial.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_monotonic() {
        assert!(Serial(1) < Serial(2));
        assert!(Serial(100) == Serial(100));
    }

    #[test]
    fn ordering_survives_wrap_around() {
        assert!(Serial(u32::MAX) < Serial(1));
    }
}
