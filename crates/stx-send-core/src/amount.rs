use alloy::primitives::utils::parse_units;
use thiserror::Error;

pub const STX_DECIMALS: u8 = 6;
pub const MICRO_STX_PER_STX: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("Amount is required")]
    Required,
    #[error("Amount of STX must be described as number")]
    NotANumber,
    #[error("You cannot send a negative amount of STX")]
    NotPositive,
    #[error("STX do not have more than 6 decimal places")]
    TooManyDecimals,
    #[error("Amount of STX is too large")]
    Overflow,
}

/// Parses a human STX amount such as `"1.25"` into µSTX.
pub fn stx_to_micro_stx(input: &str) -> Result<u64, AmountError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AmountError::Required);
    }
    let unsigned = match trimmed.strip_prefix('-') {
        Some(rest) => {
            check_numeric(rest)?;
            return Err(AmountError::NotPositive);
        }
        None => trimmed.strip_prefix('+').unwrap_or(trimmed),
    };
    check_numeric(unsigned)?;
    if let Some((_, fraction)) = unsigned.split_once('.') {
        if fraction.len() > usize::from(STX_DECIMALS) {
            return Err(AmountError::TooManyDecimals);
        }
    }
    let normalized = if unsigned.starts_with('.') {
        format!("0{unsigned}")
    } else {
        unsigned.trim_end_matches('.').to_owned()
    };
    let parsed = parse_units(&normalized, STX_DECIMALS).map_err(|_| AmountError::NotANumber)?;
    let micro = u64::try_from(parsed.get_absolute()).map_err(|_| AmountError::Overflow)?;
    if micro == 0 {
        return Err(AmountError::NotPositive);
    }
    Ok(micro)
}

/// `1500000` -> `"1.5 STX"`.
pub fn to_human_readable_stx(micro_stx: u64) -> String {
    let whole = micro_stx / MICRO_STX_PER_STX;
    let fraction = micro_stx % MICRO_STX_PER_STX;
    if fraction == 0 {
        return format!("{whole} STX");
    }
    let fraction = format!("{fraction:06}");
    format!("{whole}.{} STX", fraction.trim_end_matches('0'))
}

fn check_numeric(value: &str) -> Result<(), AmountError> {
    let mut seen_dot = false;
    let mut seen_digit = false;
    for c in value.chars() {
        match c {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => return Err(AmountError::NotANumber),
        }
    }
    if !seen_digit {
        return Err(AmountError::NotANumber);
    }
    Ok(())
}
