use bitvec::{order::Msb0, view::BitView};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{BowErr, BowResult};

/// Kind and length of the descriptors a vocabulary is built for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescKind {
    /// Packed binary descriptors (ORB, BRIEF, ...), compared by Hamming distance.
    Binary { bytes: usize },
    /// Floating point descriptors (SIFT, SURF, ...), compared by Euclidean distance.
    Float { dims: usize },
}

impl DescKind {
    /// Metric used for descriptors of this kind.
    pub fn metric(&self) -> DescriptorMetric {
        match self {
            DescKind::Binary { .. } => DescriptorMetric::Hamming,
            DescKind::Float { .. } => DescriptorMetric::Euclidean,
        }
    }
}

impl fmt::Display for DescKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescKind::Binary { bytes } => write!(f, "binary[{} bytes]", bytes),
            DescKind::Float { dims } => write!(f, "float[{} dims]", dims),
        }
    }
}

/// Distance function over descriptors. Resolved once from the descriptor
/// kind when a vocabulary is built and stored with it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorMetric {
    /// Number of differing bits.
    Hamming,
    /// Euclidean norm of the difference.
    Euclidean,
}

impl DescriptorMetric {
    /// Distance between two rows of the same matrix kind. Rows of
    /// different kinds are infinitely far apart.
    pub(crate) fn distance(&self, a: DescRef<'_>, b: DescRef<'_>) -> f64 {
        match (self, a, b) {
            (DescriptorMetric::Hamming, DescRef::Binary(a), DescRef::Binary(b)) => {
                u8::distance(a, b)
            }
            (DescriptorMetric::Euclidean, DescRef::Float(a), DescRef::Float(b)) => {
                f32::distance(a, b)
            }
            _ => f64::INFINITY,
        }
    }
}

/// Scalar component of a descriptor row. Ties the row storage type to its
/// distance and centroid computation, so tree building and descent are
/// monomorphized per kind.
pub(crate) trait Component: Copy + PartialEq + Send + Sync + 'static {
    fn distance(a: &[Self], b: &[Self]) -> f64;

    /// Centroid of a non-empty set of rows of the given width.
    fn mean<'a, I>(rows: I, width: usize) -> Vec<Self>
    where
        I: Iterator<Item = &'a [Self]>;

    fn wrap(m: Matrix<Self>) -> Descriptors;

    fn matrix(d: &Descriptors) -> Option<&Matrix<Self>>;
}

impl Component for u8 {
    #[inline]
    fn distance(a: &[u8], b: &[u8]) -> f64 {
        a.iter()
            .zip(b)
            .fold(0u32, |acc, (x, y)| acc + (x ^ y).count_ones()) as f64
    }

    /// Bitwise majority vote.
    fn mean<'a, I>(rows: I, width: usize) -> Vec<u8>
    where
        I: Iterator<Item = &'a [u8]>,
    {
        let mut counts = vec![0usize; width * 8];
        let mut n = 0usize;
        for row in rows {
            n += 1;
            for (i, b) in row.view_bits::<Msb0>().iter().enumerate() {
                if *b {
                    counts[i] += 1;
                }
            }
        }
        let n2 = n / 2;
        let mut result = vec![0u8; width];
        let result_bits = result.view_bits_mut::<Msb0>();
        for (i, &c) in counts.iter().enumerate() {
            if c > n2 {
                result_bits.set(i, true);
            }
        }
        result
    }

    fn wrap(m: Matrix<u8>) -> Descriptors {
        Descriptors::Binary(m)
    }

    fn matrix(d: &Descriptors) -> Option<&Matrix<u8>> {
        match d {
            Descriptors::Binary(m) => Some(m),
            Descriptors::Float(_) => None,
        }
    }
}

impl Component for f32 {
    #[inline]
    fn distance(a: &[f32], b: &[f32]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| {
                let d = (*x as f64) - (*y as f64);
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    fn mean<'a, I>(rows: I, width: usize) -> Vec<f32>
    where
        I: Iterator<Item = &'a [f32]>,
    {
        let mut sum = vec![0f64; width];
        let mut n = 0usize;
        for row in rows {
            n += 1;
            for (s, v) in sum.iter_mut().zip(row) {
                *s += *v as f64;
            }
        }
        let inv = if n > 0 { 1. / n as f64 } else { 0. };
        sum.into_iter().map(|s| (s * inv) as f32).collect()
    }

    fn wrap(m: Matrix<f32>) -> Descriptors {
        Descriptors::Float(m)
    }

    fn matrix(d: &Descriptors) -> Option<&Matrix<f32>> {
        match d {
            Descriptors::Float(m) => Some(m),
            Descriptors::Binary(_) => None,
        }
    }
}

/// Row-major matrix of fixed-width descriptor rows.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    width: usize,
    data: Vec<T>,
}

impl<T: Copy> Matrix<T> {
    pub(crate) fn with_width(width: usize) -> Self {
        Self {
            width,
            data: Vec::new(),
        }
    }

    fn from_data(width: usize, data: Vec<T>) -> BowResult<Self> {
        if width == 0 {
            return Err(BowErr::MalformedDescriptors(
                "descriptor width must be non-zero".into(),
            ));
        }
        if data.len() % width != 0 {
            return Err(BowErr::MalformedDescriptors(format!(
                "{} values is not a whole number of {}-wide rows",
                data.len(),
                width
            )));
        }
        Ok(Self { width, data })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn rows(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.data.len() / self.width
        }
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[T] {
        &self.data[i * self.width..(i + 1) * self.width]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[T]> + '_ {
        self.data.chunks_exact(self.width.max(1))
    }

    pub(crate) fn push(&mut self, row: &[T]) {
        debug_assert_eq!(row.len(), self.width);
        self.data.extend_from_slice(row);
    }
}

/// A set of descriptors extracted from one image (or a training corpus).
///
/// All rows share one kind and length. Binary rows are packed bytes;
/// float rows are `f32` components.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Descriptors {
    Binary(Matrix<u8>),
    Float(Matrix<f32>),
}

/// Borrowed view of a single descriptor row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DescRef<'a> {
    Binary(&'a [u8]),
    Float(&'a [f32]),
}

impl DescRef<'_> {
    pub fn kind(&self) -> DescKind {
        match self {
            DescRef::Binary(r) => DescKind::Binary { bytes: r.len() },
            DescRef::Float(r) => DescKind::Float { dims: r.len() },
        }
    }
}

impl Descriptors {
    /// Packed binary descriptors, `bytes` per row.
    pub fn binary(bytes: usize, data: Vec<u8>) -> BowResult<Self> {
        Matrix::from_data(bytes, data).map(Descriptors::Binary)
    }

    /// Float descriptors, `dims` components per row.
    pub fn float(dims: usize, data: Vec<f32>) -> BowResult<Self> {
        Matrix::from_data(dims, data).map(Descriptors::Float)
    }

    /// Build from fixed size binary rows, e.g. 32 byte ORB descriptors.
    pub fn from_binary_rows<const N: usize>(rows: &[[u8; N]]) -> BowResult<Self> {
        let data = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Self::binary(N, data)
    }

    /// Build from float rows. Every row must have the same length; a
    /// single malformed row rejects the whole set.
    pub fn from_float_rows<R: AsRef<[f32]>>(rows: &[R]) -> BowResult<Self> {
        let dims = match rows.first() {
            Some(r) => r.as_ref().len(),
            None => {
                return Err(BowErr::MalformedDescriptors(
                    "cannot infer descriptor length from zero rows".into(),
                ))
            }
        };
        let mut data = Vec::with_capacity(dims * rows.len());
        for (i, r) in rows.iter().enumerate() {
            let r = r.as_ref();
            if r.len() != dims {
                return Err(BowErr::MalformedDescriptors(format!(
                    "row {} has {} components, expected {}",
                    i,
                    r.len(),
                    dims
                )));
            }
            data.extend_from_slice(r);
        }
        Self::float(dims, data)
    }

    /// An empty set of the given kind.
    pub fn empty(kind: DescKind) -> Self {
        match kind {
            DescKind::Binary { bytes } => Descriptors::Binary(Matrix::with_width(bytes)),
            DescKind::Float { dims } => Descriptors::Float(Matrix::with_width(dims)),
        }
    }

    pub fn kind(&self) -> DescKind {
        match self {
            Descriptors::Binary(m) => DescKind::Binary { bytes: m.width() },
            Descriptors::Float(m) => DescKind::Float { dims: m.width() },
        }
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        match self {
            Descriptors::Binary(m) => m.rows(),
            Descriptors::Float(m) => m.rows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<DescRef<'_>> {
        if i >= self.len() {
            return None;
        }
        Some(match self {
            Descriptors::Binary(m) => DescRef::Binary(m.row(i)),
            Descriptors::Float(m) => DescRef::Float(m.row(i)),
        })
    }
}
