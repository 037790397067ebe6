use std::io::Write;

use crate::state::Report;

/// Render the selected paths as bordered tables, at most `max_columns`
/// ports per table so wide sweeps stay readable. Rows run from TTL 1 to the
/// shortest TTL at which the target answered.
pub fn render_tables<W: Write>(
    writer: &mut W,
    report: &Report,
    max_columns: usize,
    last_closed: u8,
) -> std::io::Result<()> {
    let ports: Vec<u16> = report.paths.keys().copied().collect();

    for chunk in ports.chunks(max_columns.max(1)) {
        render_one_table(writer, report, chunk, last_closed)?;
        writeln!(writer)?;
    }

    Ok(())
}

fn render_one_table<W: Write>(
    writer: &mut W,
    report: &Report,
    ports: &[u16],
    last_closed: u8,
) -> std::io::Result<()> {
    let mut header = vec!["TTL".to_string()];
    for port in ports {
        header.push(format!("PORT: {}", port));
        header.push("SENT/RCVD".to_string());
    }

    let mut rows = Vec::with_capacity(last_closed as usize);
    for ttl in 1..=last_closed {
        let idx = ttl as usize - 1;
        let mut row = vec![ttl.to_string()];
        for port in ports {
            let hop = report
                .paths
                .get(port)
                .and_then(|hops| hops.get(idx))
                .cloned()
                .unwrap_or_default();
            let sent = report
                .sent
                .get(port)
                .and_then(|row| row.get(idx))
                .copied()
                .unwrap_or(0);
            let rcvd = report
                .rcvd
                .get(port)
                .and_then(|row| row.get(idx))
                .copied()
                .unwrap_or(0);
            row.push(hop);
            row.push(format!("{:02}/{:02}", sent, rcvd));
        }
        rows.push(row);
    }

    let mut widths: Vec<usize> = header.iter().map(|cell| cell.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let border: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(w + 2)))
        .collect::<String>()
        + "+";

    writeln!(writer, "{}", border)?;
    write_row(writer, &header, &widths)?;
    writeln!(writer, "{}", border)?;
    for row in &rows {
        write_row(writer, row, &widths)?;
    }
    writeln!(writer, "{}", border)?;

    Ok(())
}

fn write_row<W: Write>(writer: &mut W, cells: &[String], widths: &[usize]) -> std::io::Result<()> {
    for (cell, width) in cells.iter().zip(widths.iter().copied()) {
        write!(writer, "| {:<width$} ", cell, width = width)?;
    }
    writeln!(writer, "|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report(ports: &[u16]) -> Report {
        let mut report = Report::new();
        for &port in ports {
            report
                .paths
                .insert(port, vec!["r1.example.net".into(), "target".into()]);
            report.sent.insert(port, vec![10, 9]);
            report.rcvd.insert(port, vec![5, 3]);
        }
        report
    }

    fn render(report: &Report, max_columns: usize, last_closed: u8) -> String {
        let mut buf = Vec::new();
        render_tables(&mut buf, report, max_columns, last_closed).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_counters_are_zero_padded() {
        let out = render(&sample_report(&[33000]), 4, 2);
        assert!(out.contains("10/05"), "output:\n{}", out);
        assert!(out.contains("09/03"), "output:\n{}", out);
    }

    #[test]
    fn test_rows_stop_at_last_closed() {
        let out = render(&sample_report(&[33000]), 4, 1);
        assert!(out.contains("| 1 "), "output:\n{}", out);
        assert!(!out.contains("target"), "output:\n{}", out);
    }

    #[test]
    fn test_every_port_appears_across_chunks() {
        let ports = [33000, 33001, 33002, 33003, 33004];
        let out = render(&sample_report(&ports), 4, 2);
        for port in ports {
            assert!(
                out.contains(&format!("PORT: {}", port)),
                "port {} missing:\n{}",
                port,
                out
            );
        }
        // five ports at four columns per table means two tables
        let headers = out.matches("TTL").count();
        assert_eq!(headers, 2, "output:\n{}", out);
    }

    #[test]
    fn test_single_table_when_ports_fit() {
        let out = render(&sample_report(&[33000, 33001]), 4, 2);
        assert_eq!(out.matches("TTL").count(), 1);
    }
}
