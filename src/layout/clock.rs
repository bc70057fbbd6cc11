use chrono::{DateTime, FixedOffset, Local, Offset, Timelike, Utc};

/// Wall clock used for hour-bucket selection.
///
/// The offset is fixed when the clock is built and never re-read, so every
/// bucket decision in one process uses the same timezone.
#[derive(Debug, Clone, Copy)]
pub struct HourClock {
    offset: FixedOffset,
}

impl HourClock {
    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
        }
    }

    pub fn local() -> Self {
        Self {
            offset: Local::now().offset().fix(),
        }
    }

    pub fn with_offset(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn hour_at(&self, at: DateTime<Utc>) -> u32 {
        at.with_timezone(&self.offset).hour()
    }
}
