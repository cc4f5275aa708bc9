//! Fixed-point arithmetic on Kubernetes quantities.
//!
//! Watermark comparisons are done in milli-units (thousandths) so that
//! decimal ("500m", "1.5", "2k") and binary ("1Ki") encodings compare
//! without float drift. Only the final replica ratio is ever computed in
//! floating point, by the watermark evaluator.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::Error;

/// Parse a Kubernetes quantity into milli-units.
///
/// Supports plain and decimal numbers, the milli suffix `m`, decimal SI
/// suffixes (`k`, `M`, `G`, `T`, `P`) and binary suffixes (`Ki`, `Mi`,
/// `Gi`, `Ti`, `Pi`). Scientific notation is rejected; it never appears in
/// autoscaling policies and rejecting it keeps the parser exact.
pub fn milli_value(quantity: &Quantity) -> Result<i64, Error> {
    let s = quantity.0.trim();
    if s.is_empty() {
        return Err(Error::quantity(&quantity.0, "empty quantity"));
    }

    let (number, suffix) = split_suffix(s);
    // scale expressed in milli-units per whole unit of the suffix
    let scale_milli: i128 = match suffix {
        "" => 1_000,
        "m" => 1,
        "k" => 1_000_000,
        "M" => 1_000_000_000,
        "G" => 1_000_000_000_000,
        "T" => 1_000_000_000_000_000,
        "P" => 1_000_000_000_000_000_000,
        "Ki" => 1_024 * 1_000,
        "Mi" => 1_024 * 1_024 * 1_000,
        "Gi" => 1_024 * 1_024 * 1_024 * 1_000,
        "Ti" => 1_024i128 * 1_024 * 1_024 * 1_024 * 1_000,
        "Pi" => 1_024i128 * 1_024 * 1_024 * 1_024 * 1_024 * 1_000,
        other => {
            return Err(Error::quantity(
                &quantity.0,
                format!("unknown suffix {other:?}"),
            ))
        }
    };

    let (negative, number) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(Error::quantity(&quantity.0, "missing digits"));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(Error::quantity(&quantity.0, "malformed number"));
    }

    let int_value: i128 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse()
            .map_err(|_| Error::quantity(&quantity.0, "integer part out of range"))?
    };

    let mut milli = int_value
        .checked_mul(scale_milli)
        .ok_or_else(|| Error::quantity(&quantity.0, "overflow"))?;

    if !frac_part.is_empty() {
        let frac_value: i128 = frac_part
            .parse()
            .map_err(|_| Error::quantity(&quantity.0, "fractional part out of range"))?;
        let denom = 10i128
            .checked_pow(frac_part.len() as u32)
            .ok_or_else(|| Error::quantity(&quantity.0, "fraction too precise"))?;
        milli = milli
            .checked_add(frac_value * scale_milli / denom)
            .ok_or_else(|| Error::quantity(&quantity.0, "overflow"))?;
    }

    if negative {
        milli = -milli;
    }
    i64::try_from(milli).map_err(|_| Error::quantity(&quantity.0, "value exceeds 64 bits"))
}

/// Render a milli-unit value back into a canonical quantity string.
///
/// Whole values render as plain integers, everything else with the `m`
/// suffix, matching how the status current values are reported.
pub fn from_milli(milli: i64) -> Quantity {
    if milli % 1_000 == 0 {
        Quantity((milli / 1_000).to_string())
    } else {
        Quantity(format!("{milli}m"))
    }
}

fn split_suffix(s: &str) -> (&str, &str) {
    let idx = s
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-' && c != '+')
        .unwrap_or(s.len());
    s.split_at(idx)
}
