//! Unicode screening for untrusted command strings.
//!
//! Detects homoglyph operators, BiDi overrides, zero-width characters,
//! smart quotes, and orphan combining marks before any other validation
//! stage runs. Predicates are pure and applied in a fixed order;
//! the first match wins and rejection is terminal.

use std::sync::LazyLock;

use unicode_normalization::UnicodeNormalization;

/// Unicode lookalikes for the ASCII shell operators `| ; & > <`.
///
/// Covers fullwidth forms, box-drawing verticals, the mathematical
/// "divides" sign, angle quotation marks, and small-form variants.
static HOMOGLYPH_OPERATORS: LazyLock<Vec<(char, char)>> = LazyLock::new(|| {
    vec![
        // pipe
        ('\u{FF5C}', '|'), // fullwidth vertical line
        ('\u{2502}', '|'), // box drawings light vertical
        ('\u{2503}', '|'), // box drawings heavy vertical
        ('\u{2223}', '|'), // divides
        ('\u{01C0}', '|'), // latin letter dental click
        ('\u{00A6}', '|'), // broken bar
        ('\u{2758}', '|'), // light vertical bar
        // semicolon
        ('\u{FF1B}', ';'), // fullwidth semicolon
        ('\u{037E}', ';'), // greek question mark
        ('\u{204F}', ';'), // reversed semicolon
        // ampersand
        ('\u{FF06}', '&'), // fullwidth ampersand
        ('\u{FE60}', '&'), // small ampersand
        // greater-than
        ('\u{FF1E}', '>'), // fullwidth greater-than
        ('\u{203A}', '>'), // single right-pointing angle quotation
        ('\u{00BB}', '>'), // right-pointing double angle quotation
        ('\u{FE65}', '>'), // small greater-than
        // less-than
        ('\u{FF1C}', '<'), // fullwidth less-than
        ('\u{2039}', '<'), // single left-pointing angle quotation
        ('\u{00AB}', '<'), // left-pointing double angle quotation
        ('\u{FE64}', '<'), // small less-than
    ]
});

const ZERO_WIDTH: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

/// Quote characters PowerShell interprets as string delimiters.
const SMART_QUOTES: &[char] = &[
    '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2032}', '\u{2033}',
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreatKind {
    DangerousControl,
    HomoglyphOperator { mimics: char },
    ZeroWidth,
    BidiControl,
    SmartQuote,
    CombiningMark,
    InvisibleFormat,
}

impl ThreatKind {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::DangerousControl => "control character",
            Self::HomoglyphOperator { .. } => "homoglyph operator",
            Self::ZeroWidth => "zero-width character",
            Self::BidiControl => "bidirectional control character",
            Self::SmartQuote => "smart quote",
            Self::CombiningMark => "combining mark",
            Self::InvisibleFormat => "invisible formatting character",
        }
    }
}

/// A screening hit: the kind of threat and the offending codepoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnicodeThreat {
    pub kind: ThreatKind,
    pub codepoint: char,
}

impl UnicodeThreat {
    /// `U+XXXX` label, safe to disclose in user-facing errors.
    pub fn codepoint_label(&self) -> String {
        format!("U+{:04X}", self.codepoint as u32)
    }
}

/// C0/C1 controls other than tab, LF, and CR.
pub fn find_dangerous_control(input: &str) -> Option<UnicodeThreat> {
    input
        .chars()
        .find(|&c| {
            matches!(c,
                '\u{0000}'..='\u{0008}'
                | '\u{000B}'..='\u{000C}'
                | '\u{000E}'..='\u{001F}'
                | '\u{007F}')
        })
        .map(|codepoint| UnicodeThreat {
            kind: ThreatKind::DangerousControl,
            codepoint,
        })
}

/// Unicode lookalikes of the blocked ASCII operators.
pub fn find_homoglyph_operator(input: &str) -> Option<UnicodeThreat> {
    for c in input.chars() {
        if let Some((_, mimics)) = HOMOGLYPH_OPERATORS.iter().find(|(glyph, _)| *glyph == c) {
            return Some(UnicodeThreat {
                kind: ThreatKind::HomoglyphOperator { mimics: *mimics },
                codepoint: c,
            });
        }
    }
    None
}

/// Zero-width characters and BiDi overrides/embeddings/isolates.
pub fn find_invisible_or_bidi(input: &str) -> Option<UnicodeThreat> {
    for c in input.chars() {
        if ZERO_WIDTH.contains(&c) {
            return Some(UnicodeThreat {
                kind: ThreatKind::ZeroWidth,
                codepoint: c,
            });
        }
        if matches!(c, '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}') {
            return Some(UnicodeThreat {
                kind: ThreatKind::BidiControl,
                codepoint: c,
            });
        }
    }
    None
}

/// Typographic quotes; PowerShell treats several as string delimiters.
pub fn find_smart_quote(input: &str) -> Option<UnicodeThreat> {
    input
        .chars()
        .find(|c| SMART_QUOTES.contains(c))
        .map(|codepoint| UnicodeThreat {
            kind: ThreatKind::SmartQuote,
            codepoint,
        })
}

/// Combining marks that survive NFC normalization (i.e. are not absorbed
/// into a precomposed form), plus variation selectors and other invisible
/// format characters.
pub fn find_combining_or_format(input: &str) -> Option<UnicodeThreat> {
    for c in input.nfc() {
        if matches!(c, '\u{0300}'..='\u{036F}' | '\u{20D0}'..='\u{20FF}') {
            return Some(UnicodeThreat {
                kind: ThreatKind::CombiningMark,
                codepoint: c,
            });
        }
        if matches!(
            c,
            '\u{FE00}'..='\u{FE0F}'          // variation selectors
            | '\u{E0100}'..='\u{E01EF}'      // variation selector supplement
            | '\u{2060}'                     // word joiner
            | '\u{00AD}'                     // soft hyphen
            | '\u{061C}'                     // arabic letter mark
            | '\u{206A}'..='\u{206F}' // arabic form-shaping controls
        ) {
            return Some(UnicodeThreat {
                kind: ThreatKind::InvisibleFormat,
                codepoint: c,
            });
        }
    }
    None
}

/// Run every predicate in pipeline order. `powershell` enables the
/// smart-quote screen (other shells treat those codepoints as literals).
pub fn screen(input: &str, powershell: bool) -> Result<(), UnicodeThreat> {
    if let Some(threat) = find_dangerous_control(input) {
        return Err(threat);
    }
    if let Some(threat) = find_homoglyph_operator(input) {
        return Err(threat);
    }
    if let Some(threat) = find_invisible_or_bidi(input) {
        return Err(threat);
    }
    if powershell {
        if let Some(threat) = find_smart_quote(input) {
            return Err(threat);
        }
    }
    if let Some(threat) = find_combining_or_format(input) {
        return Err(threat);
    }
    Ok(())
}
