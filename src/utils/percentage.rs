use std::{fmt::Display, ops::Deref, str::FromStr};

use anyhow::anyhow;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Percentage(f64);

impl Display for Percentage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.0)
    }
}

impl Percentage {
    pub fn new_opt(value: f64) -> Option<Percentage> {
        if value < 0. {
            None
        } else {
            Some(Percentage(value))
        }
    }
}

impl FromStr for Percentage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // This means that 100%% also works, but I think I'm fine with that
        let s = s.trim_end_matches("%");
        let v = s.parse::<f64>()?;
        Percentage::new_opt(v).ok_or_else(|| anyhow!("Can't parse {s} into percentage"))
    }
}

impl Deref for Percentage {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub fn seconds_percentage(value: i64, whole: i64) -> Percentage {
    if whole <= 0 {
        return Percentage(0.);
    }
    Percentage::new_opt(value as f64 / whole as f64 * 100.)
        .expect("Percentage should always be at least 0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_suffix() {
        assert_eq!("15".parse::<Percentage>().unwrap(), Percentage(15.));
        assert_eq!("15%".parse::<Percentage>().unwrap(), Percentage(15.));
        assert!("-1".parse::<Percentage>().is_err());
    }

    #[test]
    fn empty_whole_is_zero_percent() {
        assert_eq!(*seconds_percentage(10, 0), 0.);
        assert_eq!(*seconds_percentage(30, 60), 50.);
    }
}
