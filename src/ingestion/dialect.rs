//! CSV dialect sniffing.
//!
//! Looks at record structure (not just bytes) to pick a delimiter. A delimiter qualifies when most
//! sampled records contain it the same, non-zero number of times outside of quotes. Line breaks
//! inside quoted fields do not end a record.

use std::collections::HashMap;

use super::detect::DELIMITER_CANDIDATES;

/// Records sampled from the window, at most.
const MAX_SAMPLE_LINES: usize = 200;
/// Share of sampled records that must agree on the modal count.
const MIN_CONSISTENCY: f64 = 0.9;

/// Structural parameters of a CSV source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    pub delimiter: u8,
    pub quote: u8,
}

impl Dialect {
    /// A dialect with the given delimiter and `"` quoting.
    pub fn with_delimiter(delimiter: u8) -> Self {
        Self {
            delimiter,
            quote: b'"',
        }
    }
}

/// Why sniffing could not decide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffError {
    /// The window holds fewer than two complete lines.
    TooFewLines { lines: usize },
    /// No candidate delimiter is used consistently.
    NoConsistentDelimiter,
}

impl std::fmt::Display for SniffError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SniffError::TooFewLines { lines } => {
                write!(f, "sniff window holds {lines} complete line(s), need at least 2")
            }
            SniffError::NoConsistentDelimiter => f.write_str("could not determine delimiter"),
        }
    }
}

/// Sniff `text`, restricted to its first `limit` bytes when `limit` is set.
///
/// The window is cut back to its last complete record so a truncated one never skews counts.
/// `hint` breaks ties between equally consistent candidates.
pub fn sniff(text: &str, limit: Option<usize>, hint: Option<u8>) -> Result<Dialect, SniffError> {
    let window = match limit {
        Some(limit) if limit < text.len() => {
            let cut = floor_char_boundary(text, limit);
            match text[..cut].rfind('\n') {
                Some(last_nl) => &text[..last_nl],
                None => "",
            }
        }
        _ => text,
    };

    let lines: Vec<&str> = records(window, b'"')
        .into_iter()
        .filter(|l| !l.trim().is_empty())
        .take(MAX_SAMPLE_LINES)
        .collect();
    if lines.len() < 2 {
        return Err(SniffError::TooFewLines { lines: lines.len() });
    }

    let mut best: Option<(u8, f64)> = None;
    for &delimiter in &DELIMITER_CANDIDATES {
        let counts: Vec<usize> = lines
            .iter()
            .map(|l| count_unquoted(l, delimiter, b'"'))
            .collect();
        let Some((mode, freq)) = modal_count(&counts) else {
            continue;
        };
        if mode == 0 {
            continue;
        }
        let consistency = freq as f64 / counts.len() as f64;
        if consistency < MIN_CONSISTENCY {
            continue;
        }

        let better = match best {
            None => true,
            Some((best_delim, best_consistency)) => {
                if consistency != best_consistency {
                    consistency > best_consistency
                } else {
                    hint == Some(delimiter) && hint != Some(best_delim)
                }
            }
        };
        if better {
            best = Some((delimiter, consistency));
        }
    }

    best.map(|(delimiter, _)| Dialect::with_delimiter(delimiter))
        .ok_or(SniffError::NoConsistentDelimiter)
}

/// Split `text` on line breaks outside quotes.
///
/// A trailing record still inside an open quote is incomplete and left out.
fn records(text: &str, quote: u8) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, &b) in text.as_bytes().iter().enumerate() {
        if b == quote {
            in_quotes = !in_quotes;
        } else if b == b'\n' && !in_quotes {
            out.push(text[start..i].trim_end_matches('\r'));
            start = i + 1;
        }
    }
    if start < text.len() && !in_quotes {
        out.push(&text[start..]);
    }
    out
}

fn count_unquoted(line: &str, delimiter: u8, quote: u8) -> usize {
    let mut in_quotes = false;
    let mut count = 0;
    for &b in line.as_bytes() {
        if b == quote {
            in_quotes = !in_quotes;
        } else if b == delimiter && !in_quotes {
            count += 1;
        }
    }
    count
}

fn modal_count(counts: &[usize]) -> Option<(usize, usize)> {
    let mut freq: HashMap<usize, usize> = HashMap::new();
    for &c in counts {
        *freq.entry(c).or_default() += 1;
    }
    freq.into_iter()
        .max_by(|(ca, fa), (cb, fb)| fa.cmp(fb).then(ca.cmp(cb)))
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_semicolon() {
        let text = "col a;col b\ndata 1;data 2\ndata 3;data 4\n";
        assert_eq!(sniff(text, None, None).unwrap().delimiter, b';');
    }

    #[test]
    fn quoted_delimiters_do_not_count() {
        let text = "name,comment\n\"Smith; John\",ok\n\"Doe; Jane\",\"fine; really\"\n";
        assert_eq!(sniff(text, None, None).unwrap().delimiter, b',');
    }

    #[test]
    fn window_without_a_complete_line_is_insufficient() {
        let long = "x".repeat(5000);
        let text = format!("{long};b\n1;2\n3;4\n");
        assert_eq!(
            sniff(&text, Some(4096), None),
            Err(SniffError::TooFewLines { lines: 0 })
        );
        assert_eq!(sniff(&text, None, None).unwrap().delimiter, b';');
    }

    #[test]
    fn quoted_line_breaks_stay_inside_their_record() {
        let text = "nom;commentaire\n\
                    A;\"ligne 1\nligne 2, suite\"\n\
                    B;ok\n\
                    C;\"x\ny, z\"\n\
                    D;fin\n";
        assert_eq!(records(text, b'"').len(), 5);
        assert_eq!(sniff(text, None, None).unwrap().delimiter, b';');
    }

    #[test]
    fn window_cut_inside_a_quoted_field_drops_the_partial_record() {
        let text = "a;b\n1;2\n3;\"long\nquoted\nvalue\"\n";
        let cut = text.find("quoted").unwrap();
        assert_eq!(records(&text[..cut], b'"'), vec!["a;b", "1;2"]);
        assert_eq!(sniff(text, Some(cut), None).unwrap().delimiter, b';');
    }

    #[test]
    fn single_column_has_no_delimiter() {
        let text = "name\nAda\nGrace\n";
        assert_eq!(
            sniff(text, None, None),
            Err(SniffError::NoConsistentDelimiter)
        );
    }

    #[test]
    fn hint_breaks_ties() {
        let text = "a,b;c\n1,2;3\n";
        assert_eq!(sniff(text, None, Some(b';')).unwrap().delimiter, b';');
        assert_eq!(sniff(text, None, None).unwrap().delimiter, b',');
    }
}
