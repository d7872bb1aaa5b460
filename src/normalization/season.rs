use chrono::{Datelike, NaiveDate};

/// Inclusive month range during which a product is in season.
///
/// `start > end` wraps around the year end, so Nov..Feb covers
/// November, December, January and February.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeasonWindow {
    start: u32,
    end: u32,
}

impl SeasonWindow {
    pub fn new(start: u32, end: u32) -> Option<Self> {
        let valid = |m: u32| (1..=12).contains(&m);
        (valid(start) && valid(end)).then_some(Self { start, end })
    }

    /// Window from the nullable `seasonal_*_month` columns; both or neither.
    pub fn from_columns(start: Option<i16>, end: Option<i16>) -> Option<Self> {
        match (start, end) {
            (Some(s), Some(e)) => Self::new(u32::try_from(s).ok()?, u32::try_from(e).ok()?),
            _ => None,
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn contains_month(&self, month: u32) -> bool {
        if self.start <= self.end {
            (self.start..=self.end).contains(&month)
        } else {
            month >= self.start || month <= self.end
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.contains_month(date.month())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn plain_window() {
        let summer = SeasonWindow::new(6, 8).unwrap();
        assert!(summer.contains(day(2025, 6, 1)));
        assert!(summer.contains(day(2025, 8, 31)));
        assert!(!summer.contains(day(2025, 9, 1)));
        assert!(!summer.contains(day(2025, 5, 31)));
    }

    #[test]
    fn window_wraps_year_end() {
        let winter = SeasonWindow::new(11, 2).unwrap();
        for m in [11, 12, 1, 2] {
            assert!(winter.contains_month(m), "month {m}");
        }
        for m in 3..=10 {
            assert!(!winter.contains_month(m), "month {m}");
        }
    }

    #[test]
    fn single_month_window() {
        let dec = SeasonWindow::new(12, 12).unwrap();
        assert!(dec.contains(day(2024, 12, 24)));
        assert!(!dec.contains(day(2025, 1, 1)));
    }

    #[test]
    fn rejects_out_of_range_and_half_set_columns() {
        assert!(SeasonWindow::new(0, 5).is_none());
        assert!(SeasonWindow::new(3, 13).is_none());
        assert!(SeasonWindow::from_columns(Some(4), None).is_none());
        assert!(SeasonWindow::from_columns(Some(-1), Some(3)).is_none());
        assert_eq!(
            SeasonWindow::from_columns(Some(4), Some(9)),
            SeasonWindow::new(4, 9)
        );
    }
}
