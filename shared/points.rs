use super::source::SourceError;
use crate::types::Points;
use ndarray::{Array2, ArrayView2};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Label written for points the label file does not mention.
const UNLABELED: &str = "-";

/// Writes one line per point: `index<TAB>coord_1<TAB>...<TAB>coord_D`, plus a
/// trailing label column when `labels` is given.
///
/// The file is written next to its destination and renamed into place, so a
/// failed run never leaves a truncated points file behind.
pub fn write_points(
    path: &Path,
    points: ArrayView2<f64>,
    labels: Option<&HashMap<usize, String>>,
) -> Result<(), SourceError> {
    let temp_path = path.with_extension("tmp");
    let write_err = |source| SourceError::Write {
        path: path.to_path_buf(),
        source,
    };

    let write_result = (|| -> io::Result<()> {
        let mut writer = BufWriter::with_capacity(1 << 20, File::create(&temp_path)?);
        let mut line = String::with_capacity(points.ncols() * 24 + 16);
        let mut ryu_buffer = ryu::Buffer::new();
        for (index, row) in points.outer_iter().enumerate() {
            line.clear();
            line.push_str(&index.to_string());
            for &value in row {
                line.push('\t');
                line.push_str(ryu_buffer.format(value));
            }
            if let Some(labels) = labels {
                line.push('\t');
                line.push_str(labels.get(&index).map_or(UNLABELED, String::as_str));
            }
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        let file = writer.into_inner().map_err(io::Error::other)?;
        file.sync_all()
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(write_err(err));
    }
    fs::rename(&temp_path, path).map_err(|err| {
        let _ = fs::remove_file(&temp_path);
        write_err(err)
    })
}

fn malformed(path: &Path, line: usize, reason: impl Into<String>) -> SourceError {
    SourceError::Malformed {
        path: path.to_path_buf(),
        line,
        reason: reason.into(),
    }
}

fn open_lines(path: &Path) -> Result<io::Lines<BufReader<File>>, SourceError> {
    let file = File::open(path).map_err(|source| SourceError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file).lines())
}

/// Reads an `N x D` configuration written by [`write_points`]. Lines may come
/// in any order; columns past the D coordinates are ignored. Every index in
/// `0..points` must appear exactly once.
pub fn read_points(path: &Path, points: usize, dimension: usize) -> Result<Points, SourceError> {
    let mut out = Array2::<f64>::zeros((points, dimension));
    let mut seen = vec![false; points];
    for (line_no, line) in open_lines(path)?.enumerate() {
        let line_no = line_no + 1;
        let line = line.map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut fields = line.split_whitespace();
        let Some(index_field) = fields.next() else {
            continue;
        };
        let index: usize = lexical_core::parse(index_field.as_bytes())
            .map_err(|e| malformed(path, line_no, format!("bad point index '{index_field}': {e}")))?;
        if index >= points {
            return Err(malformed(path, line_no, format!("point index {index} is not below {points}")));
        }
        if std::mem::replace(&mut seen[index], true) {
            return Err(malformed(path, line_no, format!("point index {index} appears twice")));
        }
        for dim in 0..dimension {
            let field = fields
                .next()
                .ok_or_else(|| malformed(path, line_no, format!("expected {dimension} coordinates")))?;
            out[[index, dim]] = lexical_core::parse::<f64>(field.as_bytes())
                .map_err(|e| malformed(path, line_no, format!("bad coordinate '{field}': {e}")))?;
        }
    }
    if let Some(missing) = seen.iter().position(|s| !s) {
        return Err(malformed(path, 0, format!("point index {missing} is missing")));
    }
    Ok(out)
}

/// Reads `id label` pairs, whitespace separated, one per line.
pub fn read_labels(path: &Path) -> Result<HashMap<usize, String>, SourceError> {
    let mut labels = HashMap::new();
    for (line_no, line) in open_lines(path)?.enumerate() {
        let line = line.map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut fields = line.split_whitespace();
        let (Some(id), Some(label)) = (fields.next(), fields.next()) else {
            if line.trim().is_empty() {
                continue;
            }
            return Err(malformed(path, line_no + 1, "expected 'id label'"));
        };
        let id: usize = lexical_core::parse(id.as_bytes())
            .map_err(|e| malformed(path, line_no + 1, format!("bad id '{id}': {e}")))?;
        labels.insert(id, label.to_string());
    }
    Ok(labels)
}
