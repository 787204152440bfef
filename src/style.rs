//! Role-colored console rendering and plain-text tables.
//!
//! Active is rendered green, passive cyan; warnings yellow, errors red.
//! Table rendering is intentionally plain (padded columns, no box drawing)
//! so output stays greppable when piped to a log file.

use console::style;

pub fn render_active(s: &str) -> String {
    style(s).green().to_string()
}

pub fn render_passive(s: &str) -> String {
    style(s).cyan().to_string()
}

pub fn render_warning(s: &str) -> String {
    style(s).yellow().to_string()
}

pub fn render_error(s: &str) -> String {
    style(s).red().to_string()
}

pub fn render_info(s: &str) -> String {
    style(s).blue().to_string()
}

pub fn render_grey(s: &str) -> String {
    style(s).dim().to_string()
}

pub fn render_bold(s: &str) -> String {
    style(s).bold().to_string()
}

/// Render a padded text table with a header row.
///
/// Column widths are computed from the widest cell per column. Rows shorter
/// than the header are padded with empty cells.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let columns = headers.len();
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(columns) {
            widths[i] = widths[i].max(console::measure_text_width(cell));
        }
    }

    let mut out = String::new();
    for (i, header) in headers.iter().enumerate() {
        let pad = widths[i].saturating_sub(header.len());
        out.push_str(&render_bold(header));
        out.push_str(&" ".repeat(pad + 2));
    }
    out.push('\n');
    for row in rows {
        for i in 0..columns {
            let cell = row.get(i).map(String::as_str).unwrap_or("");
            // measure_text_width ignores ANSI escapes so styled cells align
            let pad = widths[i].saturating_sub(console::measure_text_width(cell));
            out.push_str(cell);
            out.push_str(&" ".repeat(pad + 2));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_table_alignment() {
        let table = render_table(
            &["Role", "Name"],
            &[
                vec!["active".to_string(), "host-a".to_string()],
                vec!["passive".to_string(), "b".to_string()],
            ],
        );
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("active "));
        assert!(lines[2].starts_with("passive "));
    }

    #[test]
    fn test_render_table_pads_short_rows() {
        let table = render_table(
            &["A", "B", "C"],
            &[vec!["x".to_string()]],
        );
        assert!(table.lines().count() == 2);
    }
}
