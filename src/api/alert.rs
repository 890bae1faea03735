//! Chart alert text parser.
//!
//! Alerts look like
//!
//! ```text
//! Next Candle Predictor: order buy @ 4 filled on NQ1!. Entry Price: 21000.25 Comment: entry|atr=7|stop loss=20990|ts=1730000000
//! ```
//!
//! Keywords match case-insensitively. The comment carries optional
//! `atr=<ticks>`, `stop loss=<price>` and `ts=<10 or 13 digit epoch>` fields.

use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;

use crate::domain::Side;
use crate::error::{Result, TrailgateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertIntent {
    Entry,
    Close,
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAlert {
    pub side: Side,
    pub size: u32,
    pub ticker: String,
    pub entry_price: Decimal,
    pub comment: String,
    /// ATR in ticks, as sent
    pub atr_ticks: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    /// Alert time in epoch milliseconds
    pub ts_ms: Option<i64>,
}

impl ParsedAlert {
    /// `close` wins over `exit`; anything else is an entry.
    pub fn intent(&self) -> AlertIntent {
        let comment = self.comment.to_ascii_lowercase();
        if comment.contains("close") {
            AlertIntent::Close
        } else if comment.contains("exit") {
            AlertIntent::Exit
        } else {
            AlertIntent::Entry
        }
    }
}

/// ASCII case-insensitive scanner over the alert text.
struct Cursor<'a> {
    src: &'a str,
    lower: String,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            lower: src.to_ascii_lowercase(),
            pos: 0,
        }
    }

    fn rest(&self) -> &str {
        &self.lower[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.lower.len() - trimmed.len();
    }

    fn eat(&mut self, literal: &str) -> bool {
        if self.rest().starts_with(literal) {
            self.pos += literal.len();
            true
        } else {
            false
        }
    }

    fn keyword(&mut self, literal: &str) -> Result<()> {
        self.skip_ws();
        if self.eat(literal) {
            Ok(())
        } else {
            Err(TrailgateError::Parse(format!(
                "expected '{}' at offset {}",
                literal, self.pos
            )))
        }
    }

    /// Take `[-+]?\d+(\.\d+)?` when `signed`, otherwise without the sign.
    fn number(&mut self, signed: bool) -> Option<&'a str> {
        self.skip_ws();
        let len = number_len(self.rest(), signed)?;
        let start = self.pos;
        self.pos += len;
        Some(&self.src[start..self.pos])
    }

    fn take_until(&mut self, stop: char) -> Option<&'a str> {
        let len = self.rest().find(stop)?;
        let start = self.pos;
        self.pos += len;
        Some(&self.src[start..self.pos])
    }

    fn remainder(&self) -> &'a str {
        &self.src[self.pos..]
    }
}

fn number_len(s: &str, signed: bool) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    if signed && matches!(bytes.first(), Some(b'-' | b'+')) {
        i = 1;
    }
    let int_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == int_start {
        return None;
    }
    if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    Some(i)
}

fn decimal(raw: &str, what: &str) -> Result<Decimal> {
    Decimal::from_str(raw.trim_start_matches('+'))
        .map_err(|e| TrailgateError::Parse(format!("invalid {} '{}': {}", what, raw, e)))
}

/// Find `<words...> = <value>` anywhere in `comment`, words separated by
/// optional whitespace, returning the raw value text.
fn keyed_value<'a>(comment: &'a str, words: &[&str], signed: bool) -> Option<&'a str> {
    let lower = comment.to_ascii_lowercase();
    let first = words.first()?;

    let mut from = 0;
    while let Some(hit) = lower[from..].find(first) {
        let mut cursor = Cursor::new(comment);
        cursor.pos = from + hit + first.len();
        let matched = words[1..].iter().all(|w| {
            cursor.skip_ws();
            cursor.eat(w)
        }) && {
            cursor.skip_ws();
            cursor.eat("=")
        };
        if matched {
            if let Some(value) = cursor.number(signed) {
                return Some(value);
            }
        }
        from += hit + 1;
    }
    None
}

fn comment_ts_ms(comment: &str) -> Option<i64> {
    let raw = keyed_value(comment, &["ts"], false)?;
    let digits: &str = raw.split('.').next()?;
    // longer runs keep their leading 13 digits
    let digits = &digits[..digits.len().min(13)];
    match digits.len() {
        10 => digits.parse::<i64>().ok().map(|s| s * 1000),
        11..=13 => digits.parse().ok(),
        _ => None,
    }
}

pub fn parse_alert(text: &str) -> Result<ParsedAlert> {
    let mut cursor = Cursor::new(text);
    cursor
        .keyword("next candle predictor")
        .and_then(|_| cursor.keyword(":"))
        .and_then(|_| cursor.keyword("order"))
        .map_err(|_| {
            TrailgateError::Parse("Alert text did not match expected format.".into())
        })?;

    cursor.skip_ws();
    let side = if cursor.eat("buy") {
        Side::Buy
    } else if cursor.eat("sell") {
        Side::Sell
    } else {
        return Err(TrailgateError::Parse(
            "direction must be 'buy' or 'sell'".into(),
        ));
    };

    cursor.keyword("@")?;
    let size = cursor
        .number(false)
        .filter(|raw| !raw.contains('.'))
        .ok_or_else(|| TrailgateError::Parse("missing order size".into()))?
        .parse::<u32>()
        .map_err(|e| TrailgateError::Parse(format!("invalid size: {}", e)))?;

    cursor.keyword("filled on")?;
    let ticker = cursor
        .take_until('.')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TrailgateError::Parse("missing ticker".into()))?
        .to_string();
    cursor.keyword(".")?;

    cursor.keyword("entry price:")?;
    let entry_raw = cursor
        .number(true)
        .ok_or_else(|| TrailgateError::Parse("missing entry price".into()))?;
    let entry_price = decimal(entry_raw, "entry price")?;

    cursor.keyword("comment:")?;
    let comment = cursor.remainder().trim().to_string();
    if comment.is_empty() {
        return Err(TrailgateError::Parse("empty comment".into()));
    }

    let atr_ticks = keyed_value(&comment, &["atr"], false)
        .map(|raw| decimal(raw, "atr"))
        .transpose()?;
    let stop_loss = keyed_value(&comment, &["stop", "loss"], true)
        .map(|raw| decimal(raw, "stop loss"))
        .transpose()?;
    let ts_ms = comment_ts_ms(&comment);

    Ok(ParsedAlert {
        side,
        size,
        ticker,
        entry_price,
        comment,
        atr_ticks,
        stop_loss,
        ts_ms,
    })
}
