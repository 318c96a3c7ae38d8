/// Number of decimal places used by a currency's minor unit.
pub fn currency_exponent(currency: &str) -> u32 {
	match currency.to_ascii_uppercase().as_str() {
		"JPY" | "KRW" | "ISK" | "CLP" | "VND" | "XPF" => 0,
		"BHD" | "KWD" | "OMR" | "JOD" | "TND" => 3,
		_ => 2,
	}
}

/// Convert a provider decimal amount (e.g. `-12.34` dollars) into signed minor units.
pub fn decimal_to_minor_units(amount: f64, currency: &str) -> i64 {
	let scale = 10f64.powi(currency_exponent(currency) as i32);
	(amount * scale).round() as i64
}

/// Re-express a minor-unit amount with a different number of decimals.
///
/// YNAB stores milliunits (3 decimals) and Actual stores cents (2 decimals) regardless of
/// currency, so writers rescale from the currency's own exponent. Scaling down rounds half
/// away from zero.
pub fn rescale_minor_units(amount: i64, currency: &str, target_exponent: u32) -> i64 {
	let source_exponent = currency_exponent(currency);
	if target_exponent >= source_exponent {
		amount * 10i64.pow(target_exponent - source_exponent)
	} else {
		let divisor = 10i64.pow(source_exponent - target_exponent);
		let half = divisor / 2;
		if amount >= 0 {
			(amount + half) / divisor
		} else {
			(amount - half) / divisor
		}
	}
}

/// Inverse of [`rescale_minor_units`]: bring a destination amount back to the currency's minor units.
pub fn destination_to_minor_units(amount: i64, currency: &str, source_exponent: u32) -> i64 {
	let target_exponent = currency_exponent(currency);
	if target_exponent >= source_exponent {
		amount * 10i64.pow(target_exponent - source_exponent)
	} else {
		amount / 10i64.pow(source_exponent - target_exponent)
	}
}

pub fn format_minor_units(amount: i64, currency: &str) -> String {
	let exponent = currency_exponent(currency);
	let sign = if amount < 0 { "-" } else { "" };
	let magnitude = amount.unsigned_abs();
	if exponent == 0 {
		return format!("{}{} {}", sign, magnitude, currency);
	}
	let divisor = 10u64.pow(exponent);
	format!(
		"{}{}.{:0width$} {}",
		sign,
		magnitude / divisor,
		magnitude % divisor,
		currency,
		width = exponent as usize
	)
}
