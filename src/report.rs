// Copyright The Coldboot Probe Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Assembles the CSV result report written after a Compare phase (§4.C6, non-core).
//!
//! Nothing here feeds back into the Write/Exclude/Compare protocol; a failure to write the report
//! is logged and swallowed rather than propagated, since the measurement itself already completed
//! successfully by the time this runs.

use crate::phase::RunStatistics;
use crate::platform::{Platform, ReportWriter};
use arrayvec::ArrayString;
use core::fmt::Write as _;

/// Operator-supplied context recorded alongside a Compare run's statistics.
#[derive(Debug, Clone, Default)]
pub struct ResultAnnotation {
    /// Ambient temperature in whole degrees Celsius at the time of the run, if the operator
    /// supplied one.
    pub ambient_temperature_c: Option<i32>,
    /// How long the system sat powered off between Exclude and Compare, in seconds, if known.
    pub power_off_seconds: Option<u32>,
    /// Free-text operator comments.
    pub comments: ArrayString<96>,
}

/// Derives the CSV result filename from the platform's current time, as
/// `YYYY_MM_DD_HH_MM.csv`.
pub fn result_file_name(platform: &impl Platform) -> ArrayString<32> {
    let now = platform.now();
    let mut name = ArrayString::new();
    let _ = write!(
        name,
        "{:04}_{:02}_{:02}_{:02}_{:02}.csv",
        now.year, now.month, now.day, now.hour, now.minute
    );
    name
}

/// Writes `stats` and `annotation` as a CSV report to a file named `file_name` on the platform,
/// logging (rather than propagating) any failure to do so.
pub fn write(
    platform: &impl Platform,
    file_name: &str,
    stats: &RunStatistics,
    annotation: &ResultAnnotation,
) {
    match try_write(platform, file_name, stats, annotation) {
        Ok(()) => log::info!("wrote result report {file_name}"),
        Err(err) => log::warn!("failed to write result report {file_name}: {err}"),
    }
}

fn try_write(
    platform: &impl Platform,
    file_name: &str,
    stats: &RunStatistics,
    annotation: &ResultAnnotation,
) -> Result<(), crate::error::CoreError> {
    let mut file = platform.open_result_file(file_name)?;

    write_line(&mut file, "# coldboot-probe result report")?;
    write_kv(&mut file, "product", platform.product_name().as_str())?;
    write_kv_u64(&mut file, "compared_bits", stats.compared_bits)?;
    write_kv_u64(&mut file, "differences", stats.differences())?;
    if let Some(temperature) = annotation.ambient_temperature_c {
        write_kv_i64(&mut file, "ambient_temperature_c", temperature as i64)?;
    }
    if let Some(seconds) = annotation.power_off_seconds {
        write_kv_u64(&mut file, "power_off_seconds", seconds as u64)?;
    }
    if !annotation.comments.is_empty() {
        write_kv(&mut file, "comments", annotation.comments.as_str())?;
    }

    for dimm in platform.dimm_inventory() {
        let mut line = ArrayString::<192>::new();
        let _ = write!(
            line,
            "dimm,{},{},{}\n",
            dimm.locator, dimm.bank_locator, dimm.part_number
        );
        file.write_bytes(line.as_bytes())?;
    }

    write_line(&mut file, "bit,zero_to_one,one_to_zero")?;
    for bit in 0..64 {
        let mut line = ArrayString::<32>::new();
        let _ = write!(
            line,
            "{bit},{},{}\n",
            stats.zero_to_one[bit], stats.one_to_zero[bit]
        );
        file.write_bytes(line.as_bytes())?;
    }

    file.flush()
}

fn write_line(file: &mut impl ReportWriter, line: &str) -> Result<(), crate::error::CoreError> {
    file.write_bytes(line.as_bytes())?;
    file.write_bytes(b"\n")
}

fn write_kv(
    file: &mut impl ReportWriter,
    key: &str,
    value: &str,
) -> Result<(), crate::error::CoreError> {
    let mut line = ArrayString::<160>::new();
    let _ = write!(line, "{key},{value}\n");
    file.write_bytes(line.as_bytes())
}

fn write_kv_u64(
    file: &mut impl ReportWriter,
    key: &str,
    value: u64,
) -> Result<(), crate::error::CoreError> {
    let mut line = ArrayString::<48>::new();
    let _ = write!(line, "{key},{value}\n");
    file.write_bytes(line.as_bytes())
}

fn write_kv_i64(
    file: &mut impl ReportWriter,
    key: &str,
    value: i64,
) -> Result<(), crate::error::CoreError> {
    let mut line = ArrayString::<48>::new();
    let _ = write!(line, "{key},{value}\n");
    file.write_bytes(line.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePlatform;

    #[test]
    fn writes_header_and_bit_rows() {
        let platform = FakePlatform::with_regions(&[]);
        let mut stats = RunStatistics::default();
        stats.zero_to_one[3] = 5;
        stats.one_to_zero[40] = 2;
        stats.compared_bits = 1 << 20;

        let annotation = ResultAnnotation {
            ambient_temperature_c: Some(21),
            power_off_seconds: Some(3600),
            comments: ArrayString::from("overnight run").unwrap(),
        };

        write(&platform, "result.csv", &stats, &annotation);

        let contents = platform.result_file_contents("result.csv").unwrap();
        let text = core::str::from_utf8(&contents).unwrap();
        assert!(text.contains("differences,7"));
        assert!(text.contains("ambient_temperature_c,21"));
        assert!(text.contains("power_off_seconds,3600"));
        assert!(text.contains("comments,overnight run"));
        assert!(text.contains("3,5,0"));
        assert!(text.contains("40,0,2"));
    }

    #[test]
    fn omits_absent_annotation_fields() {
        let platform = FakePlatform::with_regions(&[]);
        let stats = RunStatistics::default();
        let annotation = ResultAnnotation::default();

        write(&platform, "result.csv", &stats, &annotation);

        let contents = platform.result_file_contents("result.csv").unwrap();
        let text = core::str::from_utf8(&contents).unwrap();
        assert!(!text.contains("ambient_temperature_c"));
        assert!(!text.contains("power_off_seconds"));
        assert!(!text.contains("comments"));
    }

    #[test]
    fn result_file_name_is_derived_from_platform_time() {
        let platform = FakePlatform::with_regions(&[]);
        let name = result_file_name(&platform);
        assert_eq!(name.as_str(), "2026_01_01_00_00.csv");
    }
}
