use anyhow::Result;
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use std::io::Write;

use crate::state::Report;

/// Write the report as pretty-printed JSON with tab indentation, for
/// external tooling to analyze.
pub fn write_json<W: Write>(writer: &mut W, report: &Report) -> Result<()> {
    let formatter = PrettyFormatter::with_indent(b"\t");
    let mut serializer = Serializer::with_formatter(&mut *writer, formatter);
    report.serialize(&mut serializer)?;
    writeln!(writer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let mut report = Report::new();
        report
            .paths
            .insert(33000, vec!["r1.example.net".into(), "target".into()]);
        report.sent.insert(33000, vec![10, 10]);
        report.rcvd.insert(33000, vec![9, 10]);

        let mut buf = Vec::new();
        write_json(&mut buf, &report).unwrap();
        let out = String::from_utf8(buf).unwrap();

        assert!(out.contains("\"Paths\""));
        assert!(out.contains("\"Sent\""));
        assert!(out.contains("\"Rcvd\""));
        // map keys are stringified ports, indentation is tabs
        assert!(out.contains("\"33000\""));
        assert!(out.contains("\n\t"));

        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["Sent"]["33000"][0], 10);
        assert_eq!(parsed["Rcvd"]["33000"][1], 10);
        assert_eq!(parsed["Paths"]["33000"][1], "target");
    }
}
