use chrono::{Days, NaiveDate};

/// Report cells carry three decimal places.
pub const REPORT_PRECISION: i32 = 3;

pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.checked_sub_days(Days::new(1)))
        .unwrap_or(NaiveDate::MAX)
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

pub fn round3(value: f64) -> f64 {
    round_to(value, REPORT_PRECISION)
}

/// Proof gallons = wine gallons x proof / 100, with proof = 2 x ABV.
pub fn proof_gallons(volume_gallons: f64, alcohol_by_volume: f64) -> f64 {
    volume_gallons * (alcohol_by_volume * 2.0) / 100.0
}

pub fn approx_eq(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_day_of_month() {
        assert_eq!(
            last_day_of_month(2023, 2),
            NaiveDate::from_ymd_opt(2023, 2, 28).unwrap()
        );
        assert_eq!(
            last_day_of_month(2024, 2),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_eq!(
            last_day_of_month(2023, 12),
            NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()
        );
    }

    #[test]
    fn test_round3() {
        assert_eq!(round3(1.23456), 1.235);
        assert_eq!(round3(-0.0004), 0.0);
        assert_eq!(round3(100.0), 100.0);
    }

    #[test]
    fn test_proof_gallons() {
        // 100 gallons at 50% ABV is 100 proof, i.e. 100 proof gallons
        assert!(approx_eq(proof_gallons(100.0, 50.0), 100.0, 1e-9));
        assert!(approx_eq(proof_gallons(53.0, 40.0), 42.4, 1e-9));
    }
}
