//! MDIF text codec for parameterized network sets.
//!
//! Each network is written as one block: its parameters as `VAR` lines,
//! followed by an `ACDATA` section holding one row per frequency point.
//!
//! ```text
//! VAR calibrated(boolean) = 0
//! VAR phi(real) = -10
//! VAR polarization(string) = "V"
//! VAR theta(real) = 0
//! BEGIN ACDATA
//! # HZ S RI R 50
//! % F n11x n11y
//! 1000000000 0.0125 -0.5
//! END
//! ```
//!
//! Network names are not stored. Lines starting with `!` are comments.
//! String values are quoted, with `\\`, `\"`, `\n`, `\r`, `\t` and
//! `\u{..}` escapes so any text fits on its `VAR` line.

use std::io::Write;

use ndarray::Array1;
use num_complex::Complex64;
use thiserror::Error;

use crate::network::{Frequency, Network, NetworkError, ParamValue, Params};

/// Error while decoding MDIF text
#[derive(Error, Debug)]
pub enum MdifError {
    /// IO error while writing
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed line
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// Block data did not form a valid network
    #[error("line {line}: {source}")]
    Network {
        line: usize,
        #[source]
        source: NetworkError,
    },
}

fn syntax(line: usize, message: impl Into<String>) -> MdifError {
    MdifError::Syntax {
        line,
        message: message.into(),
    }
}

/// Sample layout declared by the `#` option line.
#[derive(Debug, Clone, Copy, PartialEq)]
enum DataFormat {
    RealImag,
    MagAngle,
    DbAngle,
}

/// Write networks as consecutive MDIF blocks.
pub fn write_networks<W: Write>(writer: &mut W, networks: &[Network]) -> Result<(), MdifError> {
    for network in networks {
        for (key, value) in network.params() {
            let (kind, text) = match value {
                ParamValue::Real(v) => ("real", format!("{v}")),
                ParamValue::Int(v) => ("int", format!("{v}")),
                ParamValue::Text(s) => ("string", format!("\"{}\"", escape(s))),
                ParamValue::Bool(b) => ("boolean", if *b { "1" } else { "0" }.to_string()),
            };
            writeln!(writer, "VAR {key}({kind}) = {text}")?;
        }
        writeln!(writer, "BEGIN ACDATA")?;
        writeln!(writer, "# HZ S RI R 50")?;
        writeln!(writer, "% F n11x n11y")?;
        for (f, s) in network.frequency().hz().iter().zip(network.s().iter()) {
            writeln!(writer, "{f} {} {}", s.re, s.im)?;
        }
        writeln!(writer, "END")?;
        writeln!(writer)?;
    }
    Ok(())
}

/// Parse every block in `text` into networks, in file order.
pub fn parse_networks(text: &str) -> Result<Vec<Network>, MdifError> {
    let mut networks = Vec::new();
    let mut params = Params::new();
    let mut block: Option<Block> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('!') {
            continue;
        }

        let upper = line.to_ascii_uppercase();
        if let Some(data) = block.as_mut() {
            if upper == "END" {
                let finished = block.take().map(|b| b.finish(std::mem::take(&mut params)));
                if let Some(result) = finished {
                    networks.push(result.map_err(|source| MdifError::Network {
                        line: line_no,
                        source,
                    })?);
                }
            } else if line.starts_with('#') {
                data.parse_options(line, line_no)?;
            } else if line.starts_with('%') {
                continue;
            } else {
                data.parse_row(line, line_no)?;
            }
        } else if upper.starts_with("VAR ") {
            let (key, value) = parse_var(&line[4..], line_no)?;
            params.insert(key, value);
        } else if upper.starts_with("BEGIN") {
            block = Some(Block::new());
        } else {
            return Err(syntax(line_no, format!("unexpected line outside block: {line}")));
        }
    }

    if block.is_some() {
        return Err(syntax(text.lines().count(), "unterminated ACDATA block"));
    }

    Ok(networks)
}

/// Parse `name(type) = value`.
fn parse_var(decl: &str, line: usize) -> Result<(String, ParamValue), MdifError> {
    let (lhs, rhs) = decl
        .split_once('=')
        .ok_or_else(|| syntax(line, "VAR without '='"))?;
    let lhs = lhs.trim();
    let rhs = rhs.trim();

    let (name, kind) = match lhs.split_once('(') {
        Some((name, rest)) => (
            name.trim(),
            rest.trim_end_matches(')').trim().to_ascii_lowercase(),
        ),
        None => (lhs, "real".to_string()),
    };
    if name.is_empty() {
        return Err(syntax(line, "VAR without a name"));
    }

    let bad = |what: &str| syntax(line, format!("invalid {what} value for {name}: {rhs}"));
    let value = match kind.as_str() {
        "real" => ParamValue::Real(rhs.parse().map_err(|_| bad("real"))?),
        "int" => ParamValue::Int(rhs.parse().map_err(|_| bad("int"))?),
        "string" => {
            let quoted = rhs.strip_prefix('"').and_then(|r| r.strip_suffix('"'));
            let inner = quoted.unwrap_or(rhs);
            ParamValue::Text(unescape(inner).ok_or_else(|| bad("string"))?)
        }
        "boolean" | "bool" => match rhs.to_ascii_lowercase().as_str() {
            "1" | "true" => ParamValue::Bool(true),
            "0" | "false" => ParamValue::Bool(false),
            _ => return Err(bad("boolean")),
        },
        other => return Err(syntax(line, format!("unknown VAR type '{other}'"))),
    };

    Ok((name.to_string(), value))
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{{{:x}}}", u32::from(c))),
            c => out.push(c),
        }
    }
    out
}

/// Reverse [`escape`]. `None` on a malformed escape.
fn unescape(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'u' => {
                let rest = chars.as_str().strip_prefix('{')?;
                let (hex, tail) = rest.split_once('}')?;
                out.push(char::from_u32(u32::from_str_radix(hex, 16).ok()?)?);
                chars = tail.chars();
            }
            _ => return None,
        }
    }
    Some(out)
}

/// Accumulates one ACDATA block.
struct Block {
    scale: f64,
    format: DataFormat,
    hz: Vec<f64>,
    s: Vec<Complex64>,
}

impl Block {
    fn new() -> Self {
        Self {
            scale: 1.0,
            format: DataFormat::RealImag,
            hz: Vec::new(),
            s: Vec::new(),
        }
    }

    fn parse_options(&mut self, line: &str, line_no: usize) -> Result<(), MdifError> {
        for token in line.trim_start_matches('#').split_whitespace() {
            match token.to_ascii_uppercase().as_str() {
                "HZ" => self.scale = 1.0,
                "KHZ" => self.scale = 1e3,
                "MHZ" => self.scale = 1e6,
                "GHZ" => self.scale = 1e9,
                "RI" => self.format = DataFormat::RealImag,
                "MA" => self.format = DataFormat::MagAngle,
                "DB" => self.format = DataFormat::DbAngle,
                "S" | "R" => {}
                other if other.parse::<f64>().is_ok() => {}
                other => return Err(syntax(line_no, format!("unsupported option '{other}'"))),
            }
        }
        Ok(())
    }

    fn parse_row(&mut self, line: &str, line_no: usize) -> Result<(), MdifError> {
        let values = line
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| syntax(line_no, format!("non-numeric data row: {line}")))?;
        let [f, a, b] = values[..] else {
            return Err(syntax(
                line_no,
                format!("expected 3 columns, found {}", values.len()),
            ));
        };

        let sample = match self.format {
            DataFormat::RealImag => Complex64::new(a, b),
            DataFormat::MagAngle => Complex64::from_polar(a, b.to_radians()),
            DataFormat::DbAngle => Complex64::from_polar(10f64.powf(a / 20.0), b.to_radians()),
        };
        self.hz.push(f * self.scale);
        self.s.push(sample);
        Ok(())
    }

    fn finish(self, params: Params) -> Result<Network, NetworkError> {
        let mut network = Network::new(Frequency::from_hz(self.hz), Array1::from_vec(self.s))?;
        network.set_params(params);
        Ok(network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_write_then_parse_preserves_params_and_samples() {
        let freq = Frequency::from_hz(vec![1.0e9, 1.5e9, 2.0e9]);
        let s = Array1::from_vec(vec![
            Complex64::new(0.1, -0.2),
            Complex64::new(1.0 / 3.0, 0.0),
            Complex64::new(-0.5, 1e-9),
        ]);
        let mut ntwk = Network::new(freq, s).unwrap().with_name("dropped");
        ntwk.tag(-12.5, 30.0, "V \"co\" \\ x", true);

        let mut buf = Vec::new();
        write_networks(&mut buf, &[ntwk.clone()]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let parsed = parse_networks(&text).unwrap();

        assert_eq!(parsed.len(), 1);
        let back = &parsed[0];
        assert_eq!(back.name(), None);
        assert_eq!(back.phi(), Some(-12.5));
        assert_eq!(back.theta(), Some(30.0));
        assert_eq!(back.polarization(), Some("V \"co\" \\ x"));
        assert!(back.is_calibrated());
        assert_eq!(back.s(), ntwk.s());
        assert_eq!(back.frequency(), ntwk.frequency());
    }

    #[test]
    fn test_multiline_label_stays_on_one_var_line() {
        let freq = Frequency::from_hz(vec![1.0e9]);
        let mut ntwk = Network::new(freq, Array1::from_vec(vec![Complex64::new(1.0, 0.0)])).unwrap();
        ntwk.tag(0.0, 0.0, "V\nBEGIN ACDATA\r\tx\u{7}", false);

        let mut buf = Vec::new();
        write_networks(&mut buf, &[ntwk]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.matches("BEGIN ACDATA").count(), 2);
        assert!(text.contains(r#"VAR polarization(string) = "V\nBEGIN ACDATA\r\tx\u{7}""#));

        let parsed = parse_networks(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].polarization(), Some("V\nBEGIN ACDATA\r\tx\u{7}"));
    }

    #[test]
    fn test_bad_string_escape_is_error() {
        let text = "VAR polarization(string) = \"V\\q\"\nBEGIN ACDATA\n1 1 0\nEND\n";
        match parse_networks(text) {
            Err(MdifError::Syntax { line, .. }) => assert_eq!(line, 1),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_parse_mag_angle_ghz_block() {
        let text = "\
! comment
VAR gain(int) = 3
BEGIN ACDATA
# GHZ S MA R 50
% F n11x n11y
1.0 2.0 90
END
";
        let parsed = parse_networks(text).unwrap();
        assert_eq!(parsed.len(), 1);
        let ntwk = &parsed[0];
        assert_eq!(ntwk.param("gain"), Some(&ParamValue::Int(3)));
        assert_relative_eq!(ntwk.frequency().hz()[0], 1e9);
        assert_relative_eq!(ntwk.s()[0].re, 0.0, epsilon = 1e-12);
        assert_relative_eq!(ntwk.s()[0].im, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_unterminated_block_is_error() {
        let text = "BEGIN ACDATA\n1 2 3\n";
        assert!(matches!(
            parse_networks(text),
            Err(MdifError::Syntax { .. })
        ));
    }

    #[test]
    fn test_bad_row_reports_line() {
        let text = "BEGIN ACDATA\n1 2\nEND\n";
        match parse_networks(text) {
            Err(MdifError::Syntax { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
