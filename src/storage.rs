//! Matrix persistence: delimited text files and JSON documents.
//!
//! Text files hold one matrix row per line. A complex matrix with `N` columns
//! occupies `2N` columns, each entry written as its real part followed by its
//! imaginary part.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::DMatrix;
use num_complex::Complex64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::linalg::{to_complex, CMatrix};

pub trait MatrixStorage: Send + Sync + fmt::Debug {
    fn put_real(&self, mat: &DMatrix<f64>, dest: &Path) -> Result<()>;

    fn put_complex(&self, mat: &CMatrix, dest: &Path) -> Result<()>;

    fn get_real(&self, source: &Path) -> Result<DMatrix<f64>>;

    fn get_complex(&self, source: &Path) -> Result<CMatrix>;
}

#[derive(Debug, Clone, Default)]
pub struct TextMatrixStorage {
    /// `None` separates with spaces and splits on any whitespace.
    delimiter: Option<char>,
}

impl TextMatrixStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    fn write_rows<I>(&self, dest: &Path, rows: I) -> Result<()>
    where
        I: Iterator<Item = Vec<f64>>,
    {
        let sep = self.delimiter.map_or_else(|| " ".to_string(), String::from);
        let mut writer = BufWriter::new(create_file(dest)?);
        for row in rows {
            let line = row
                .iter()
                .map(|v| format!("{v:e}"))
                .collect::<Vec<_>>()
                .join(&sep);
            writeln!(writer, "{line}").with_context(|| format!("write matrix row to {:?}", dest))?;
        }
        writer
            .flush()
            .with_context(|| format!("flush matrix file {:?}", dest))
    }

    fn read_rows(&self, source: &Path) -> Result<(usize, usize, Vec<f64>)> {
        let file = File::open(source).with_context(|| format!("open matrix file {:?}", source))?;
        let mut values = Vec::new();
        let mut ncols: Option<usize> = None;
        let mut nrows = 0;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("read matrix file {:?}", source))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = match self.delimiter {
                Some(delimiter) => trimmed.split(delimiter).map(str::trim).collect(),
                None => trimmed.split_whitespace().collect(),
            };
            match ncols {
                Some(expected) if expected != fields.len() => bail!(
                    "{:?} line {} has {} columns, expected {}",
                    source,
                    lineno + 1,
                    fields.len(),
                    expected
                ),
                _ => ncols = Some(fields.len()),
            }
            for field in fields {
                let value: f64 = field.parse().with_context(|| {
                    format!("parse {:?} on line {} of {:?}", field, lineno + 1, source)
                })?;
                values.push(value);
            }
            nrows += 1;
        }
        Ok((nrows, ncols.unwrap_or(0), values))
    }
}

impl MatrixStorage for TextMatrixStorage {
    fn put_real(&self, mat: &DMatrix<f64>, dest: &Path) -> Result<()> {
        self.write_rows(dest, mat.row_iter().map(|row| row.iter().copied().collect()))
    }

    fn put_complex(&self, mat: &CMatrix, dest: &Path) -> Result<()> {
        self.write_rows(
            dest,
            mat.row_iter()
                .map(|row| row.iter().flat_map(|v| [v.re, v.im]).collect()),
        )
    }

    fn get_real(&self, source: &Path) -> Result<DMatrix<f64>> {
        let (nrows, ncols, values) = self.read_rows(source)?;
        Ok(DMatrix::from_row_slice(nrows, ncols, &values))
    }

    fn get_complex(&self, source: &Path) -> Result<CMatrix> {
        let (nrows, ncols, values) = self.read_rows(source)?;
        if ncols % 2 != 0 {
            bail!(
                "{:?} has {} columns; complex data needs (re, im) pairs",
                source,
                ncols
            );
        }
        Ok(CMatrix::from_row_iterator(
            nrows,
            ncols / 2,
            values
                .chunks_exact(2)
                .map(|pair| Complex64::new(pair[0], pair[1])),
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMatrix {
    rows: usize,
    cols: usize,
    /// Row-major.
    re: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    im: Option<Vec<f64>>,
}

impl StoredMatrix {
    fn check(&self, source: &Path) -> Result<()> {
        let expected = self.rows * self.cols;
        let im_len = self.im.as_ref().map_or(expected, Vec::len);
        if self.re.len() != expected || im_len != expected {
            bail!(
                "{:?} declares {}x{} but holds {} real and {} imaginary values",
                source,
                self.rows,
                self.cols,
                self.re.len(),
                im_len
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMatrixStorage;

impl MatrixStorage for JsonMatrixStorage {
    fn put_real(&self, mat: &DMatrix<f64>, dest: &Path) -> Result<()> {
        let stored = StoredMatrix {
            rows: mat.nrows(),
            cols: mat.ncols(),
            re: mat.transpose().iter().copied().collect(),
            im: None,
        };
        write_json(dest, &stored)
    }

    fn put_complex(&self, mat: &CMatrix, dest: &Path) -> Result<()> {
        let row_major = mat.transpose();
        let stored = StoredMatrix {
            rows: mat.nrows(),
            cols: mat.ncols(),
            re: row_major.iter().map(|v| v.re).collect(),
            im: Some(row_major.iter().map(|v| v.im).collect()),
        };
        write_json(dest, &stored)
    }

    fn get_real(&self, source: &Path) -> Result<DMatrix<f64>> {
        let stored: StoredMatrix = read_json(source)?;
        stored.check(source)?;
        if let Some(im) = &stored.im {
            if im.iter().any(|v| *v != 0.0) {
                return Err(anyhow!("{:?} holds complex data", source));
            }
        }
        Ok(DMatrix::from_row_slice(stored.rows, stored.cols, &stored.re))
    }

    fn get_complex(&self, source: &Path) -> Result<CMatrix> {
        let stored: StoredMatrix = read_json(source)?;
        stored.check(source)?;
        match &stored.im {
            Some(im) => Ok(CMatrix::from_row_iterator(
                stored.rows,
                stored.cols,
                stored
                    .re
                    .iter()
                    .zip(im)
                    .map(|(re, im)| Complex64::new(*re, *im)),
            )),
            None => Ok(to_complex(&DMatrix::from_row_slice(
                stored.rows,
                stored.cols,
                &stored.re,
            ))),
        }
    }
}

fn create_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create parent directory {:?}", parent))?;
    }
    File::create(path).with_context(|| format!("create file {:?}", path))
}

pub(crate) fn read_json<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let file = File::open(path).with_context(|| format!("open json file {:?}", path))?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).with_context(|| format!("deserialize json file {:?}", path))
}

pub(crate) fn write_json<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize,
{
    let writer = BufWriter::new(create_file(path)?);
    serde_json::to_writer(writer, value)
        .with_context(|| format!("serialize json file {:?}", path))
}
