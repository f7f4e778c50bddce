use lazy_static::lazy_static;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

lazy_static! {
    static ref STYLE_URL_RGX: Regex = Regex::new(r#"url\(["']?(.*?)["']?\)"#).unwrap();
    static ref STYLE_WIDTH_RGX: Regex = Regex::new(r"width:\s*([\d.]+)px").unwrap();
    static ref STYLE_HEIGHT_RGX: Regex = Regex::new(r"height:\s*([\d.]+)px").unwrap();
    static ref DIGITS_RGX: Regex = Regex::new(r"\d+").unwrap();
}

const USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
];

/// Mask an account identifier for logs. Never log the raw id.
pub fn mask(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() > 6 {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 3..].iter().collect();
        format!("{}***{}", head, tail)
    } else if !chars.is_empty() {
        format!("{}***", chars[0])
    } else {
        "***".to_owned()
    }
}

/// RNG seeded from the account id. Same id, same stream, across restarts.
pub fn account_rng(id: &str) -> StdRng {
    StdRng::seed_from_u64(account_hash(id))
}

/// Stable filesystem-safe key for an account, used to name cookie files
/// and screenshots without leaking the identifier.
pub fn account_key(id: &str) -> String {
    format!("{:016x}", account_hash(id))
}

fn account_hash(id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

/// Pick a user agent for an account. Deterministic per account id.
pub fn user_agent_for(id: &str) -> &'static str {
    let idx = account_rng(id).gen_range(0..USER_AGENTS.len());
    USER_AGENTS[idx]
}

pub fn url_from_style(style: &str) -> Option<String> {
    STYLE_URL_RGX
        .captures(style)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
}

pub fn width_from_style(style: &str) -> Option<f64> {
    STYLE_WIDTH_RGX
        .captures(style)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn height_from_style(style: &str) -> Option<f64> {
    STYLE_HEIGHT_RGX
        .captures(style)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Concatenate every digit run in `text` and parse the result.
/// The points balance is rendered with thousands separators.
pub fn digits(text: &str) -> Option<u64> {
    let joined: String = DIGITS_RGX
        .find_iter(text)
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .concat();
    if joined.is_empty() {
        return None;
    }
    // Clamp absurd lengths so a garbage page can't overflow the parse.
    joined[..joined.len().min(15)].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_hides_middle() {
        assert_eq!(mask("someone@example.com"), "som***com");
        assert_eq!(mask("abcdef"), "a***");
        assert_eq!(mask(""), "***");
    }

    #[test]
    fn account_rng_is_deterministic() {
        let a: Vec<u32> = account_rng("user-a").sample_iter(rand::distributions::Standard).take(4).collect();
        let b: Vec<u32> = account_rng("user-a").sample_iter(rand::distributions::Standard).take(4).collect();
        assert_eq!(a, b);
        assert_eq!(user_agent_for("user-a"), user_agent_for("user-a"));
        assert_eq!(account_key("user-a"), account_key("user-a"));
        assert_ne!(account_key("user-a"), account_key("user-b"));
    }

    #[test]
    fn style_parsing() {
        let style = r#"background-image: url("https://captcha.example/bg.jpg"); width: 340px; height: 212.5px;"#;
        assert_eq!(
            url_from_style(style).as_deref(),
            Some("https://captcha.example/bg.jpg")
        );
        assert_eq!(width_from_style(style), Some(340.0));
        assert_eq!(height_from_style(style), Some(212.5));
        assert_eq!(url_from_style("color: red"), None);
    }

    #[test]
    fn digits_joins_runs() {
        assert_eq!(digits("12,345 points"), Some(12345));
        assert_eq!(digits("no numbers here"), None);
    }
}
