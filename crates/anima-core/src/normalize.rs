//! Speakable-text normalization, applied before every synthesis call.
//!
//! Rewrites digit expressions the TTS engines mispronounce — colon times,
//! time ranges, bare numeric ranges — into spoken English, strips emoji,
//! and collapses whitespace. `normalize` is a pure function and idempotent:
//! its output contains none of the patterns it rewrites.

use once_cell::sync::Lazy;
use regex::Regex;

// "21:30-21:45" (optionally spaced around the dash).
static TIME_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2}):(\d{2})\s*[-~]\s*(\d{1,2}):(\d{2})").unwrap());

// A lone "21:30".
static TIME_SINGLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,2}):(\d{2})").unwrap());

// "3-8" as in an age or count range. Requires digits on both sides so
// hyphenated words and negative numbers pass through untouched.
static NUM_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*[-~]\s*(\d+)").unwrap());

static MULTISPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}").unwrap());

/// Normalization options. `spell_out_numbers` additionally rewrites every
/// remaining integer into words, for voices that read digit strings poorly.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    pub spell_out_numbers: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            spell_out_numbers: false,
        }
    }
}

/// Rewrite `text` into its speakable form. Idempotent.
pub fn normalize(text: &str, opts: NormalizeOptions) -> String {
    let mut out = TIME_RANGE
        .replace_all(text, |c: &regex::Captures| {
            format!(
                "{} o'clock {} to {} o'clock {} minutes",
                &c[1],
                trim_leading_zero(&c[2]),
                &c[3],
                trim_leading_zero(&c[4])
            )
        })
        .into_owned();
    out = TIME_SINGLE
        .replace_all(&out, |c: &regex::Captures| {
            let minutes = trim_leading_zero(&c[2]);
            if minutes == "0" {
                format!("{} o'clock", &c[1])
            } else {
                format!("{} o'clock {} minutes", &c[1], minutes)
            }
        })
        .into_owned();
    out = NUM_RANGE
        .replace_all(&out, |c: &regex::Captures| format!("{} to {}", &c[1], &c[2]))
        .into_owned();

    out = out.chars().filter(|c| !is_emoji(*c)).collect();

    if opts.spell_out_numbers {
        out = spell_out_integers(&out);
    }

    let out = MULTISPACE.replace_all(&out, " ");
    out.trim().to_string()
}

fn trim_leading_zero(s: &str) -> &str {
    let trimmed = s.trim_start_matches('0');
    if trimmed.is_empty() {
        "0"
    } else {
        trimmed
    }
}

fn is_emoji(c: char) -> bool {
    matches!(c as u32,
        0x1F000..=0x1FAFF       // pictographs, transport, supplemental symbols
        | 0x2600..=0x27BF       // misc symbols, dingbats
        | 0x2B00..=0x2BFF       // arrows and stars
        | 0xFE00..=0xFE0F       // variation selectors
        | 0x200D                // zero-width joiner
        | 0x20E3                // combining keycap
    )
}

/// Rewrite every standalone integer into English words. Numbers above
/// 999,999 are left as digits.
fn spell_out_integers(text: &str) -> String {
    static INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
    INT.replace_all(text, |c: &regex::Captures| {
        match c[0].parse::<u64>() {
            Ok(n) if n < 1_000_000 => int_to_words(n),
            _ => c[0].to_string(),
        }
    })
    .into_owned()
}

fn int_to_words(n: u64) -> String {
    const ONES: [&str; 20] = [
        "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
        "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
        "nineteen",
    ];
    const TENS: [&str; 10] = [
        "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
    ];
    match n {
        0..=19 => ONES[n as usize].to_string(),
        20..=99 => {
            let t = TENS[(n / 10) as usize];
            if n % 10 == 0 {
                t.to_string()
            } else {
                format!("{}-{}", t, ONES[(n % 10) as usize])
            }
        }
        100..=999 => {
            let head = format!("{} hundred", ONES[(n / 100) as usize]);
            if n % 100 == 0 {
                head
            } else {
                format!("{} {}", head, int_to_words(n % 100))
            }
        }
        _ => {
            let head = format!("{} thousand", int_to_words(n / 1000));
            if n % 1000 == 0 {
                head
            } else {
                format!("{} {}", head, int_to_words(n % 1000))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: NormalizeOptions = NormalizeOptions {
        spell_out_numbers: false,
    };

    #[test]
    fn time_range_becomes_spoken_form() {
        assert_eq!(
            normalize("open 21:30-21:45 daily", PLAIN),
            "open 21 o'clock 30 to 21 o'clock 45 minutes daily"
        );
    }

    #[test]
    fn single_time_on_the_hour_drops_minutes() {
        assert_eq!(normalize("doors at 9:00", PLAIN), "doors at 9 o'clock");
        assert_eq!(
            normalize("doors at 9:05", PLAIN),
            "doors at 9 o'clock 5 minutes"
        );
    }

    #[test]
    fn numeric_range_becomes_to() {
        assert_eq!(
            normalize("for children aged 3-8 years", PLAIN),
            "for children aged 3 to 8 years"
        );
    }

    #[test]
    fn hyphenated_words_untouched() {
        assert_eq!(normalize("a well-known fact", PLAIN), "a well-known fact");
    }

    #[test]
    fn emoji_stripped() {
        assert_eq!(normalize("great news 🎉🎉", PLAIN), "great news");
    }

    #[test]
    fn idempotent_with_and_without_spelling() {
        for opts in [
            PLAIN,
            NormalizeOptions {
                spell_out_numbers: true,
            },
        ] {
            for input in [
                "open 21:30-21:45, ages 3-8 🎉",
                "meet at 7:00 sharp",
                "already normal text",
            ] {
                let once = normalize(input, opts);
                assert_eq!(normalize(&once, opts), once, "not idempotent: {input:?}");
            }
        }
    }

    #[test]
    fn spell_out_rewrites_integers() {
        let opts = NormalizeOptions {
            spell_out_numbers: true,
        };
        assert_eq!(normalize("wait 15 minutes", opts), "wait fifteen minutes");
        assert_eq!(
            normalize("about 1250 people", opts),
            "about one thousand two hundred fifty people"
        );
    }

    #[test]
    fn int_words_edge_values() {
        assert_eq!(int_to_words(0), "zero");
        assert_eq!(int_to_words(21), "twenty-one");
        assert_eq!(int_to_words(100), "one hundred");
        assert_eq!(int_to_words(999_999), "nine hundred ninety-nine thousand nine hundred ninety-nine");
    }
}
