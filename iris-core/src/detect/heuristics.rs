//! DNS anomaly heuristics: tunnelled-exfiltration entropy and DGA n-gram
//! scoring. Both operate on the first (leftmost) label of the queried
//! name, where encoders put their payload.

/// Labels at or above this length with entropy at or above the threshold
/// look like base32/base64 payload chunks.
const EXFIL_MIN_LABEL_LEN: usize = 16;
const EXFIL_ENTROPY_THRESHOLD: f64 = 4.0;

const DGA_MIN_LABEL_LEN: usize = 10;
const DGA_SCORE_THRESHOLD: f64 = 0.65;

/// Bigrams frequent in legitimate hostnames. A label mostly made of pairs
/// outside this set reads as machine-generated.
const COMMON_BIGRAMS: &[&str] = &[
    "th", "he", "in", "er", "an", "re", "on", "at", "en", "nd", "ti", "es",
    "or", "te", "of", "ed", "is", "it", "al", "ar", "st", "to", "nt", "ng",
    "se", "ha", "as", "ou", "io", "le", "ve", "co", "me", "de", "hi", "ri",
    "ro", "ic", "ne", "ea", "ra", "ce", "li", "ch", "ll", "be", "ma", "si",
    "om", "ur", "ca", "el", "ta", "la", "ns", "di", "fo", "ho", "pe", "ec",
    "pr", "no", "ct", "us", "ac", "ot", "il", "tr", "ly", "nc", "et", "ut",
    "ss", "so", "rs", "un", "lo", "wa", "ge", "ie", "wh", "ee", "wi", "em",
    "ad", "ol", "rt", "po", "we", "na", "ul", "ni", "ts", "mo", "ow", "pa",
    "im", "mi", "ai", "sh",
];

fn first_label(domain: &str) -> &str {
    domain.split('.').next().unwrap_or(domain)
}

/// Shannon entropy in bits per byte over the label.
pub fn label_entropy(label: &str) -> f64 {
    if label.is_empty() {
        return 0.0;
    }
    let mut counts = [0u32; 256];
    for &b in label.as_bytes() {
        counts[b as usize] += 1;
    }
    let len = label.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = f64::from(c) / len;
            -p * p.log2()
        })
        .sum()
}

/// Does the query look like data smuggled through DNS labels?
pub fn looks_like_exfil(domain: &str) -> bool {
    let label = first_label(domain);
    label.len() >= EXFIL_MIN_LABEL_LEN
        && label_entropy(label) >= EXFIL_ENTROPY_THRESHOLD
}

/// Fraction of the label's bigrams that are uncommon in real hostnames.
pub fn dga_score(domain: &str) -> f64 {
    let label = first_label(domain).to_ascii_lowercase();
    let bytes = label.as_bytes();
    if bytes.len() < 2 {
        return 0.0;
    }
    let alpha_pairs: Vec<&[u8]> = bytes
        .windows(2)
        .filter(|w| w.iter().all(u8::is_ascii_alphabetic))
        .collect();
    if alpha_pairs.is_empty() {
        // All-digit or all-punctuation labels score as fully uncommon.
        return 1.0;
    }
    let uncommon = alpha_pairs
        .iter()
        .filter(|pair| {
            let s = std::str::from_utf8(pair).expect("ascii alphabetic");
            !COMMON_BIGRAMS.contains(&s)
        })
        .count();
    uncommon as f64 / alpha_pairs.len() as f64
}

/// Does the name look algorithmically generated?
pub fn looks_like_dga(domain: &str) -> bool {
    let label = first_label(domain);
    label.len() >= DGA_MIN_LABEL_LEN
        && dga_score(domain) >= DGA_SCORE_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_of_uniform_label_is_high() {
        assert!(label_entropy("abcdefghijklmnop") > 3.9);
        assert!(label_entropy("aaaaaaaaaaaaaaaa") < 0.1);
    }

    #[test]
    fn base32_payload_labels_flag_as_exfil() {
        assert!(looks_like_exfil(
            "mzxw6ytboi2gk4ramrqxiyjam5uxg.exfil.example.com"
        ));
        assert!(!looks_like_exfil("www.example.com"));
        // Long but monotone labels stay quiet.
        assert!(!looks_like_exfil("aaaaaaaaaaaaaaaaaaaa.example.com"));
    }

    #[test]
    fn dga_names_flag_normal_names_do_not() {
        assert!(looks_like_dga("xkqzjvwpqhzt.com"));
        assert!(!looks_like_dga("documentation.example.com"));
        assert!(!looks_like_dga("short.io"));
    }
}
