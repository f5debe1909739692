// Supplier-facing projections must never expose a full citizen
// identifier. Anything that is not a well-formed CPF (11 digits) or
// CNS (15 digits) is masked entirely.

pub fn mask_cpf(raw: &str) -> String {
    let digits = digits_of(raw);
    if digits.len() != 11 {
        return full_mask(digits.len());
    }
    format!("{}.xxx.{}-xx", &digits[0..3], &digits[6..9])
}

pub fn mask_cns(raw: &str) -> String {
    let digits = digits_of(raw);
    if digits.len() != 15 {
        return full_mask(digits.len());
    }
    format!("{}xxxxxx{}", &digits[0..3], &digits[12..15])
}

fn digits_of(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn full_mask(digit_count: usize) -> String {
    "x".repeat(digit_count.clamp(3, 11))
}
