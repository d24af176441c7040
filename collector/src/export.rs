use crate::errors::Result;
use crate::model::Measurement;
use crate::tz::{format_local, DATETIME_FORMAT};
use chrono_tz::Tz;
use std::io::Write;

/// Replaces every non-word character with `_` so the name is safe in a filename.
pub fn clean_filename_part(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

pub fn run_filename(device_name: &str, run_name: &str) -> String {
    format!(
        "data-{}-{}.csv",
        clean_filename_part(device_name),
        clean_filename_part(run_name)
    )
}

pub fn device_filename(device_name: &str) -> String {
    format!("data-{}.csv", clean_filename_part(device_name))
}

/// Writes a `Date added` column plus one column per device column, oldest row first.
pub fn write_csv<W: Write>(
    writer: W,
    columns: &[String],
    measurements: &[Measurement],
    tz: Tz,
) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);

    let mut header = Vec::with_capacity(columns.len() + 1);
    header.push("Date added");
    header.extend(columns.iter().map(String::as_str));
    wtr.write_record(&header)?;

    let mut ordered: Vec<&Measurement> = measurements.iter().collect();
    ordered.sort_by_key(|m| (m.date_added, m.id));

    for m in ordered {
        let mut record = Vec::with_capacity(m.data.len() + 1);
        record.push(format_local(m.date_added, DATETIME_FORMAT, tz));
        record.extend(m.data.iter().map(|v| format_value(*v)));
        wtr.write_record(&record)?;
    }

    wtr.flush()?;
    Ok(())
}

pub fn to_csv_bytes(columns: &[String], measurements: &[Measurement], tz: Tz) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_csv(&mut buf, columns, measurements, tz)?;
    Ok(buf)
}

// Whole numbers keep their trailing ".0" so the column type stays obvious.
fn format_value(v: f64) -> String {
    format!("{:?}", v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_run_export() {
        let t = utc("2024-01-01T10:00:00Z");
        let measurements = vec![
            Measurement {
                id: 2,
                device_id: 1,
                run_id: Some(1),
                date_added: t + Duration::seconds(30),
                data: vec![21.0, 45.5],
            },
            Measurement {
                id: 1,
                device_id: 1,
                run_id: Some(1),
                date_added: t,
                data: vec![20.5, 44.0],
            },
        ];
        let columns = vec!["temp".to_string(), "humidity".to_string()];

        let bytes = to_csv_bytes(&columns, &measurements, chrono_tz::Europe::Warsaw).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Date added,temp,humidity");
        assert_eq!(lines[1], "2024-01-01 11:00:00,20.5,44.0");
        assert_eq!(lines[2], "2024-01-01 11:00:30,21.0,45.5");
    }

    #[test]
    fn test_header_quotes_awkward_column_names() {
        let columns = vec!["temp, inside".to_string()];
        let text = String::from_utf8(to_csv_bytes(&columns, &[], chrono_tz::UTC).unwrap()).unwrap();
        assert_eq!(text.trim_end(), "Date added,\"temp, inside\"");
    }

    #[test]
    fn test_filenames() {
        assert_eq!(run_filename("Garden probe", "run #1/2"), "data-Garden_probe-run__1_2.csv");
        assert_eq!(device_filename("łódź-1"), "data-łódź_1.csv");
    }
}
