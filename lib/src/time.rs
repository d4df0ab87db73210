use std::{fmt, ops};

use serde::{Deserialize, Serialize};

/// Seconds in a Kerbin solar day.
pub const KERBIN_DAY: f64 = 6.0 * 60.0 * 60.0;
/// Days in a Kerbin year.
pub const KERBIN_YEAR_DAYS: f64 = 426.0;

/// Universal time, in seconds since the start of the game.
///
/// Stored as a raw `f64` so that the optimizers can carry a NaN date
/// through an infeasible candidate without panicking.
#[derive(Copy, Clone, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
pub struct UT(f64);

impl UT {
    pub const ZERO: UT = UT(0.0);

    pub fn new_seconds(sec: f64) -> UT {
        UT(sec)
    }

    /// Build a date from the KSP calendar, both `year` and `day`
    /// starting at 1.
    pub fn new_ydhms(year: u32, day: u32, hours: u8, minutes: u8, seconds: f64) -> Self {
        let days = (year.saturating_sub(1) as f64) * KERBIN_YEAR_DAYS + day.saturating_sub(1) as f64;
        Self(days * KERBIN_DAY + hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds)
    }

    pub fn into_seconds(self) -> f64 {
        self.0
    }

    pub fn is_finite(self) -> bool {
        self.0.is_finite()
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0.0
    }

    /// Whole Kerbin years elapsed since the epoch.
    pub fn years(self) -> i64 {
        (self.0 / (KERBIN_DAY * KERBIN_YEAR_DAYS)).floor() as i64
    }

    /// Day within the current year, starting at 0.
    pub fn day_of_year(self) -> i64 {
        (self.0.rem_euclid(KERBIN_DAY * KERBIN_YEAR_DAYS) / KERBIN_DAY).floor() as i64
    }

    pub fn hours(self) -> u8 {
        (self.0.rem_euclid(KERBIN_DAY) / 3600.0).floor() as u8
    }

    pub fn minutes(self) -> u8 {
        (self.0.rem_euclid(3600.0) / 60.0).floor() as u8
    }

    pub fn seconds(self) -> u8 {
        self.0.rem_euclid(60.0).floor() as u8
    }

    #[must_use]
    pub fn min(self, other: UT) -> UT {
        UT(self.0.min(other.0))
    }

    #[must_use]
    pub fn max(self, other: UT) -> UT {
        UT(self.0.max(other.0))
    }
}

impl ops::Sub<UT> for UT {
    type Output = f64;

    fn sub(self, rhs: UT) -> Self::Output {
        self.0 - rhs.0
    }
}

impl ops::Sub<f64> for UT {
    type Output = UT;

    fn sub(self, rhs: f64) -> Self::Output {
        UT(self.0 - rhs)
    }
}

impl ops::Add<f64> for UT {
    type Output = UT;

    fn add(self, rhs: f64) -> Self::Output {
        UT(self.0 + rhs)
    }
}

impl ops::AddAssign<f64> for UT {
    fn add_assign(&mut self, rhs: f64) {
        self.0 += rhs;
    }
}

impl fmt::Display for UT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.0.is_finite() {
            return write!(f, "UT({})", self.0);
        }
        if f.alternate() {
            write!(f, "UT({}s)", self.0)
        } else {
            write!(
                f,
                "Year {}, Day {}, {:02}:{:02}:{:02}",
                self.years() + 1,
                self.day_of_year() + 1,
                self.hours(),
                self.minutes(),
                self.seconds()
            )
        }
    }
}

impl fmt::Debug for UT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:#}")
    }
}

#[test]
fn calendar() {
    let ut = UT::new_ydhms(2, 3, 4, 5, 6.0);
    assert_eq!(ut.years(), 1);
    assert_eq!(ut.day_of_year(), 2);
    assert_eq!(ut.hours(), 4);
    assert_eq!(ut.minutes(), 5);
    assert_eq!(ut.seconds(), 6);
    assert_eq!(format!("{ut}"), "Year 2, Day 3, 04:05:06");
    assert_eq!(UT::new_seconds(10.0) - UT::new_seconds(4.0), 6.0);
}
