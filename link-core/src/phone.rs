//! Phone number comparison.
//!
//! Numbers coming out of the local stores are formatted inconsistently
//! (`+1 (555) 123-4567`, `5551234567`, `15551234567`). Two numbers are the
//! same party when their last ten digits agree, which tolerates a missing or
//! different country code.

/// Number of trailing digits compared.
pub const SIGNIFICANT_DIGITS: usize = 10;

/// Strip everything but ASCII digits.
pub fn digits(number: &str) -> String {
    number.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// The trailing significant digits of a number (all digits if shorter).
pub fn normalize(number: &str) -> String {
    let d = digits(number);
    if d.len() > SIGNIFICANT_DIGITS {
        d[d.len() - SIGNIFICANT_DIGITS..].to_string()
    } else {
        d
    }
}

/// Whether two numbers refer to the same party.
///
/// Numbers without any digits (short codes spelled out, e-mail senders)
/// only match on exact text.
pub fn same_number(a: &str, b: &str) -> bool {
    let (na, nb) = (normalize(a), normalize(b));
    if na.is_empty() || nb.is_empty() {
        return a.trim().eq_ignore_ascii_case(b.trim()) && !a.trim().is_empty();
    }
    na == nb
}

/// Whether `number` is one of the phone's own numbers (multi-SIM aware).
pub fn is_own_number<S: AsRef<str>>(number: &str, own_numbers: &[S]) -> bool {
    own_numbers
        .iter()
        .any(|own| !own.as_ref().trim().is_empty() && same_number(number, own.as_ref()))
}
