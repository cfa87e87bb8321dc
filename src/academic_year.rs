use chrono::{Datelike, NaiveDate, NaiveDateTime};

pub const SQL_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Half-open interval `[start, end)` covering one academic year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcademicYearWindow {
    pub year: i32,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl AcademicYearWindow {
    /// `None` when `start_month` is outside 1-12 or the year is out of chrono's range.
    pub fn new(year: i32, start_month: u32) -> Option<Self> {
        let start = first_of_month(year, start_month)?;
        let end = first_of_month(year.checked_add(1)?, start_month)?;
        Some(Self { year, start, end })
    }

    /// Lower and upper bounds in the store's text datetime format.
    pub fn bounds_as_sql(&self) -> (String, String) {
        (
            self.start.format(SQL_DATETIME_FORMAT).to_string(),
            self.end.format(SQL_DATETIME_FORMAT).to_string(),
        )
    }
}

fn first_of_month(year: i32, month: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

/// Academic year that `at` falls in; months before `start_month` belong to the previous year.
pub fn academic_year_of(at: NaiveDateTime, start_month: u32) -> i32 {
    if at.month() >= start_month {
        at.year()
    } else {
        at.year() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, SQL_DATETIME_FORMAT).expect("datetime")
    }

    #[test]
    fn window_spans_start_month_to_start_month() {
        let w = AcademicYearWindow::new(2023, 9).expect("window");
        assert_eq!(w.start, dt("2023-09-01 00:00:00"));
        assert_eq!(w.end, dt("2024-09-01 00:00:00"));
        assert_eq!(w.year, 2023);
    }

    #[test]
    fn bounds_pad_single_digit_months() {
        let w = AcademicYearWindow::new(2023, 9).expect("window");
        assert_eq!(
            w.bounds_as_sql(),
            (
                "2023-09-01 00:00:00".to_string(),
                "2024-09-01 00:00:00".to_string()
            )
        );
        let w = AcademicYearWindow::new(2023, 10).expect("window");
        assert_eq!(w.bounds_as_sql().0, "2023-10-01 00:00:00");
    }

    #[test]
    fn invalid_month_has_no_window() {
        assert!(AcademicYearWindow::new(2023, 0).is_none());
        assert!(AcademicYearWindow::new(2023, 13).is_none());
    }

    #[test]
    fn academic_year_rolls_over_at_start_month() {
        assert_eq!(academic_year_of(dt("2024-03-15 10:00:00"), 9), 2023);
        assert_eq!(academic_year_of(dt("2024-09-01 00:00:00"), 9), 2024);
        assert_eq!(academic_year_of(dt("2024-03-15 10:00:00"), 1), 2024);
    }

    #[test]
    fn window_end_overflow_has_no_window() {
        assert!(AcademicYearWindow::new(i32::MAX, 9).is_none());
    }
}
