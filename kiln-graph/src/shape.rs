use std::fmt::{Debug, Display, Formatter};

use itertools::{zip_eq, Itertools};

/// Build a [Shape] from a list of dimensions, each either a `usize` or a [Dim].
#[macro_export]
macro_rules! shape {
    [$($value:expr),* $(,)?] => {
        $crate::shape::Shape::new(vec![$($crate::shape::Dim::from($value)),*])
    };
}

/// A single, possibly symbolic, dimension.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub enum Dim {
    Fixed(usize),
    /// Unknown until execution time.
    Dynamic,
}

/// A possibly symbolic tensor shape, as declared in a network.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Shape {
    pub dims: Vec<Dim>,
}

/// A fully known shape, as used at execution time.
#[derive(Clone, Eq, PartialEq, Hash, Default)]
pub struct ConcreteShape {
    pub dims: Vec<usize>,
}

impl Dim {
    pub const DYNAMIC: Dim = Dim::Dynamic;
    pub const ONE: Dim = Dim::Fixed(1);

    /// Convert from the conventional `-1` sentinel representation.
    pub fn from_i64(value: i64) -> Option<Dim> {
        match value {
            -1 => Some(Dim::Dynamic),
            v if v >= 0 => Some(Dim::Fixed(v as usize)),
            _ => None,
        }
    }

    pub fn to_i64(self) -> i64 {
        match self {
            Dim::Fixed(v) => v as i64,
            Dim::Dynamic => -1,
        }
    }

    pub fn is_dynamic(self) -> bool {
        matches!(self, Dim::Dynamic)
    }

    pub fn fixed(self) -> Option<usize> {
        match self {
            Dim::Fixed(v) => Some(v),
            Dim::Dynamic => None,
        }
    }

    pub fn matches(self, value: usize) -> bool {
        match self {
            Dim::Fixed(v) => v == value,
            Dim::Dynamic => true,
        }
    }
}

impl From<usize> for Dim {
    fn from(value: usize) -> Self {
        Dim::Fixed(value)
    }
}

impl std::ops::Mul for Dim {
    type Output = Dim;

    fn mul(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            // zero stays zero, even if the other side is unknown
            (Dim::Fixed(0), _) | (_, Dim::Fixed(0)) => Dim::Fixed(0),
            (Dim::Fixed(a), Dim::Fixed(b)) => Dim::Fixed(a * b),
            _ => Dim::Dynamic,
        }
    }
}

impl std::iter::Product for Dim {
    fn product<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Dim::ONE, |a, d| a * d)
    }
}

impl Shape {
    pub const SCALAR: Shape = Shape { dims: vec![] };

    pub fn new(dims: Vec<Dim>) -> Shape {
        Shape { dims }
    }

    pub fn fixed(dims: &[usize]) -> Shape {
        Shape::new(dims.iter().map(|&d| Dim::Fixed(d)).collect_vec())
    }

    /// Parse the `-1`-as-dynamic convention. Returns `None` for other negative values.
    pub fn from_i64s(dims: &[i64]) -> Option<Shape> {
        dims.iter().map(|&d| Dim::from_i64(d)).collect::<Option<Vec<_>>>().map(Shape::new)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn has_axis(&self, axis: usize) -> bool {
        axis < self.rank()
    }

    pub fn is_dynamic(&self) -> bool {
        self.dims.iter().any(|d| d.is_dynamic())
    }

    pub fn dynamic_axes(&self) -> Vec<usize> {
        self.dims.iter().positions(|d| d.is_dynamic()).collect_vec()
    }

    pub fn as_fixed(&self) -> Option<ConcreteShape> {
        self.dims
            .iter()
            .map(|d| d.fixed())
            .collect::<Option<Vec<_>>>()
            .map(ConcreteShape::new)
    }

    pub fn size(&self) -> Dim {
        self.dims.iter().copied().product()
    }

    /// Whether `concrete` is a valid instantiation of this shape.
    pub fn contains(&self, concrete: &ConcreteShape) -> bool {
        self.rank() == concrete.rank() && zip_eq(&self.dims, &concrete.dims).all(|(d, &c)| d.matches(c))
    }

    pub fn slice(&self, start: usize, end: usize) -> Shape {
        Shape::new(self.dims[start..end].to_vec())
    }

    pub fn concat(mut self, other: &Shape) -> Shape {
        self.dims.extend_from_slice(&other.dims);
        self
    }
}

impl From<&ConcreteShape> for Shape {
    fn from(shape: &ConcreteShape) -> Self {
        Shape::fixed(&shape.dims)
    }
}

impl std::ops::Index<usize> for Shape {
    type Output = Dim;

    fn index(&self, axis: usize) -> &Self::Output {
        assert!(axis < self.rank(), "Axis {} out of bounds for {:?}", axis, self);
        &self.dims[axis]
    }
}

impl ConcreteShape {
    pub fn new(dims: Vec<usize>) -> Self {
        ConcreteShape { dims }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    /// Componentwise `self <= other`, false if the ranks differ.
    pub fn all_le(&self, other: &ConcreteShape) -> bool {
        self.rank() == other.rank() && zip_eq(&self.dims, &other.dims).all(|(a, b)| a <= b)
    }

    pub fn unwrap_4(&self) -> [usize; 4] {
        self.dims
            .as_slice()
            .try_into()
            .unwrap_or_else(|_| panic!("Expected rank 4 shape, got {:?}", self))
    }
}

impl From<Vec<usize>> for ConcreteShape {
    fn from(dims: Vec<usize>) -> Self {
        ConcreteShape::new(dims)
    }
}

impl From<&[usize]> for ConcreteShape {
    fn from(dims: &[usize]) -> Self {
        ConcreteShape::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for ConcreteShape {
    fn from(dims: [usize; N]) -> Self {
        ConcreteShape::new(dims.to_vec())
    }
}

impl Debug for Shape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Shape{}", self)
    }
}

impl Debug for Dim {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dim({})", self)
    }
}

impl Debug for ConcreteShape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConcreteShape{}", self)
    }
}

impl Display for Dim {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Dim::Fixed(v) => write!(f, "{}", v),
            Dim::Dynamic => write!(f, "-1"),
        }
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fmt_shape_impl(f, &self.dims)
    }
}

impl Display for ConcreteShape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fmt_shape_impl(f, &self.dims)
    }
}

fn fmt_shape_impl(f: &mut Formatter, dims: &[impl Display]) -> std::fmt::Result {
    write!(f, "({})", dims.iter().join(", "))
}
