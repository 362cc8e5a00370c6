use nom::{
    character::complete::{satisfy, space0},
    bytes::complete::{take_while, take_while1},
    sequence::{pair, preceded},
    IResult,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub letter: char,
    /// The number exactly as written, e.g. "38.2" or "-.5".
    pub raw: String,
    pub value: f64,
}
impl Word {
    pub fn is(&self, letter: char, raw: &str) -> bool {
        self.letter == letter && self.raw == raw
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TokenizedLine {
    pub words: Vec<Word>,
    /// Words whose number could not be read; excluded from `words`.
    pub invalid: Vec<String>,
}
impl TokenizedLine {
    pub fn is_empty(&self) -> bool {
        self.words.is_empty() && self.invalid.is_empty()
    }
}

/// Removes `( ... )` and `;` comments. An unterminated parenthesis comments out the rest of the line.
pub fn strip_comments(line: &str) -> String {
    let mut result = String::with_capacity(line.len());
    let mut depth = 0usize;
    for c in line.chars() {
        match c {
            ';' if depth == 0 => break,
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => result.push(c),
            _ => (),
        }
    }
    result
}

fn strip_checksum(line: &str) -> &str {
    match line.find('*') {
        Some(index) => &line[..index],
        None => line,
    }
}

fn is_value_char(c: char) -> bool {
    !c.is_whitespace() && !c.is_ascii_alphabetic()
}

// A letter, then everything up to the next letter or whitespace. Validity of the number is decided later.
fn parse_word(input: &str) -> IResult<&str, (char, &str)> {
    pair(
        satisfy(|c| c.is_ascii_alphabetic()),
        preceded(space0, take_while(is_value_char)),
    )(input)
}

fn parse_junk(input: &str) -> IResult<&str, &str> {
    take_while1(is_value_char)(input)
}

fn parse_number(raw: &str) -> Option<f64> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-' || c == '+') {
        return None;
    }
    raw.parse::<f64>().ok().filter(|value| value.is_finite())
}

pub fn tokenize_line(line: &str) -> TokenizedLine {
    let stripped = strip_comments(line);
    let mut input = strip_checksum(&stripped).trim();
    let mut result = TokenizedLine::default();
    if let Some(rest) = input.strip_prefix('/') {
        input = rest.trim_start();
    }
    // Program delimiters and firmware system commands carry no words.
    if input.starts_with('%') || input.starts_with('$') {
        return result;
    }
    loop {
        input = input.trim_start();
        if input.is_empty() {
            return result;
        }
        match parse_word(input) {
            Ok((rest, (letter, raw))) => {
                let letter = letter.to_ascii_uppercase();
                match parse_number(raw) {
                    Some(value) => result.words.push(Word {
                        letter,
                        raw: normalize_raw(raw),
                        value,
                    }),
                    None => result.invalid.push(format!("{}{}", letter, raw)),
                }
                input = rest;
            }
            Err(_) => match parse_junk(input) {
                Ok((rest, _)) => input = rest,
                Err(_) => return result,
            },
        }
    }
}

// "G01" and "G1" name the same code; "G38.2" keeps its fraction.
fn normalize_raw(raw: &str) -> String {
    let unsigned = raw.trim_start_matches('+');
    let (integer, fraction) = match unsigned.split_once('.') {
        Some((integer, fraction)) => (integer, Some(fraction)),
        None => (unsigned, None),
    };
    let (sign, digits) = match integer.strip_prefix('-') {
        Some(digits) => ("-", digits),
        None => ("", integer),
    };
    let digits = digits.trim_start_matches('0');
    let digits = if digits.is_empty() { "0" } else { digits };
    match fraction {
        Some(fraction) if !fraction.trim_end_matches('0').is_empty() => {
            format!("{}{}.{}", sign, digits, fraction.trim_end_matches('0'))
        }
        _ => format!("{}{}", sign, digits),
    }
}
