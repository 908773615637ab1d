/// Byte accounting for one direction of a tour.
///
/// Content is available while fewer than `limit` posted bytes wait to be consumed.
/// Crossing back under the limit is reported once by [`ContentMeter::consume`] so the
/// paused reader can be resumed.
#[derive(Debug, Clone, Default)]
pub struct ContentMeter {
    posted: u64,
    consumed: u64,
    limit: u64,
}

impl ContentMeter {
    pub fn new(limit: u64) -> Self {
        Self {
            posted: 0,
            consumed: 0,
            limit,
        }
    }

    pub(crate) fn reset(&mut self, limit: u64) {
        *self = Self::new(limit);
    }

    #[inline]
    pub fn posted(&self) -> u64 {
        self.posted
    }

    #[inline]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    #[inline]
    pub fn outstanding(&self) -> u64 {
        self.posted - self.consumed
    }

    #[inline]
    pub fn available(&self) -> bool {
        self.outstanding() < self.limit
    }

    /// Accounts `len` freshly posted bytes and reports whether more may follow.
    pub fn post(&mut self, len: usize) -> bool {
        self.posted += len as u64;
        self.available()
    }

    /// Accounts `len` consumed bytes. Returns true when this brought the meter back
    /// under its limit.
    pub fn consume(&mut self, len: usize) -> bool {
        let was_available = self.available();
        self.consumed += len as u64;
        if self.consumed > self.posted {
            sink!(
                "content meter: consumed {} bytes of {} posted",
                self.consumed,
                self.posted
            );
        }
        !was_available && self.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumes_once_when_crossing_limit() {
        let mut meter = ContentMeter::new(100);
        assert!(meter.post(60));
        assert!(!meter.post(60));
        assert!(!meter.consume(10));
        assert!(meter.consume(20));
        // already available, no second resume
        assert!(!meter.consume(30));
        assert_eq!(meter.outstanding(), 60);
    }

    #[test]
    #[should_panic(expected = "consumed 5 bytes of 4 posted")]
    fn over_consumption_is_fatal() {
        let mut meter = ContentMeter::new(100);
        meter.post(4);
        meter.consume(5);
    }
}
