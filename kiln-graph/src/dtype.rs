use std::fmt::{Display, Formatter};

use bytemuck::Pod;
use ndarray::{ArcArray, IxDyn};

use crate::shape::ConcreteShape;

/// Host-side tensor storage. An `ArcArray` so reshaping and cloning are cheap.
pub type Tensor<T> = ArcArray<T, IxDyn>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DType {
    F32,
    I(DSize),
    U(DSize),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DSize {
    S8,
    S16,
    S32,
    S64,
}

/// A host tensor tagged with its element type.
#[derive(Debug, Clone, PartialEq)]
pub enum DTensor {
    F32(Tensor<f32>),
    I8(Tensor<i8>),
    I16(Tensor<i16>),
    I32(Tensor<i32>),
    I64(Tensor<i64>),
    U8(Tensor<u8>),
    U16(Tensor<u16>),
    U32(Tensor<u32>),
    U64(Tensor<u64>),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ByteLengthMismatch {
    pub expected: usize,
    pub actual: usize,
}

impl DType {
    pub const I8: DType = DType::I(DSize::S8);
    pub const I32: DType = DType::I(DSize::S32);
    pub const I64: DType = DType::I(DSize::S64);

    pub fn size(self) -> DSize {
        match self {
            DType::F32 => DSize::S32,
            DType::I(size) => size,
            DType::U(size) => size,
        }
    }

    pub fn is_signed(self) -> bool {
        match self {
            DType::F32 => true,
            DType::I(_) => true,
            DType::U(_) => false,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }

    pub fn is_int(self) -> bool {
        !self.is_float()
    }

    /// Stable numeric code, used by the plan format.
    pub fn code(self) -> u8 {
        match self {
            DType::F32 => 0,
            DType::I(size) => 0x10 | size.code(),
            DType::U(size) => 0x20 | size.code(),
        }
    }

    pub fn from_code(code: u8) -> Option<DType> {
        let size = DSize::from_code(code & 0x0f)?;
        match code & 0xf0 {
            0x00 if code == 0 => Some(DType::F32),
            0x10 => Some(DType::I(size)),
            0x20 => Some(DType::U(size)),
            _ => None,
        }
    }
}

impl DSize {
    pub fn bytes(self) -> usize {
        match self {
            DSize::S8 => 1,
            DSize::S16 => 2,
            DSize::S32 => 4,
            DSize::S64 => 8,
        }
    }

    fn code(self) -> u8 {
        match self {
            DSize::S8 => 0,
            DSize::S16 => 1,
            DSize::S32 => 2,
            DSize::S64 => 3,
        }
    }

    fn from_code(code: u8) -> Option<DSize> {
        match code {
            0 => Some(DSize::S8),
            1 => Some(DSize::S16),
            2 => Some(DSize::S32),
            3 => Some(DSize::S64),
            _ => None,
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "FLOAT"),
            DType::I(size) => write!(f, "INT{}", size.bytes() * 8),
            DType::U(size) => write!(f, "UINT{}", size.bytes() * 8),
        }
    }
}

/// Run `$body` with `$T` bound to the element type, `$f` to a function wrapping a `Tensor<$T>` back into a `DTensor`
/// and `$inner` to the inner tensor.
#[macro_export]
macro_rules! dispatch_dtensor {
    ($outer:expr, |$T:ident, $f:ident, $inner:ident| $expr:expr) => {{
        use $crate::dtype::DTensor;
        match $outer {
            DTensor::F32($inner) => {
                type $T = f32;
                let $f = DTensor::F32;
                $expr
            }
            DTensor::I8($inner) => {
                type $T = i8;
                let $f = DTensor::I8;
                $expr
            }
            DTensor::I16($inner) => {
                type $T = i16;
                let $f = DTensor::I16;
                $expr
            }
            DTensor::I32($inner) => {
                type $T = i32;
                let $f = DTensor::I32;
                $expr
            }
            DTensor::I64($inner) => {
                type $T = i64;
                let $f = DTensor::I64;
                $expr
            }
            DTensor::U8($inner) => {
                type $T = u8;
                let $f = DTensor::U8;
                $expr
            }
            DTensor::U16($inner) => {
                type $T = u16;
                let $f = DTensor::U16;
                $expr
            }
            DTensor::U32($inner) => {
                type $T = u32;
                let $f = DTensor::U32;
                $expr
            }
            DTensor::U64($inner) => {
                type $T = u64;
                let $f = DTensor::U64;
                $expr
            }
        }
    }};
}

/// Same as [dispatch_dtensor] but starting from a [DType], for constructing new tensors.
#[macro_export]
macro_rules! dispatch_dtype {
    ($outer:expr, |$T:ident, $f:ident| $expr:expr) => {{
        use $crate::dtype::{DSize, DTensor, DType};
        match $outer {
            DType::F32 => {
                type $T = f32;
                let $f = DTensor::F32;
                $expr
            }
            DType::I(DSize::S8) => {
                type $T = i8;
                let $f = DTensor::I8;
                $expr
            }
            DType::I(DSize::S16) => {
                type $T = i16;
                let $f = DTensor::I16;
                $expr
            }
            DType::I(DSize::S32) => {
                type $T = i32;
                let $f = DTensor::I32;
                $expr
            }
            DType::I(DSize::S64) => {
                type $T = i64;
                let $f = DTensor::I64;
                $expr
            }
            DType::U(DSize::S8) => {
                type $T = u8;
                let $f = DTensor::U8;
                $expr
            }
            DType::U(DSize::S16) => {
                type $T = u16;
                let $f = DTensor::U16;
                $expr
            }
            DType::U(DSize::S32) => {
                type $T = u32;
                let $f = DTensor::U32;
                $expr
            }
            DType::U(DSize::S64) => {
                type $T = u64;
                let $f = DTensor::U64;
                $expr
            }
        }
    }};
}

impl DTensor {
    pub fn zeros(dtype: DType, shape: &ConcreteShape) -> DTensor {
        dispatch_dtype!(dtype, |T, f| f(Tensor::<T>::zeros(IxDyn(&shape.dims))))
    }

    pub fn dtype(&self) -> DType {
        match self {
            DTensor::F32(_) => DType::F32,
            DTensor::I8(_) => DType::I(DSize::S8),
            DTensor::I16(_) => DType::I(DSize::S16),
            DTensor::I32(_) => DType::I(DSize::S32),
            DTensor::I64(_) => DType::I(DSize::S64),
            DTensor::U8(_) => DType::U(DSize::S8),
            DTensor::U16(_) => DType::U(DSize::S16),
            DTensor::U32(_) => DType::U(DSize::S32),
            DTensor::U64(_) => DType::U(DSize::S64),
        }
    }

    pub fn shape(&self) -> &[usize] {
        dispatch_dtensor!(self, |_T, _f, inner| inner.shape())
    }

    pub fn concrete_shape(&self) -> ConcreteShape {
        ConcreteShape::new(self.shape().to_vec())
    }

    pub fn len(&self) -> usize {
        dispatch_dtensor!(self, |_T, _f, inner| inner.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len() * self.dtype().size().bytes()
    }

    pub fn reshape(&self, shape: &ConcreteShape) -> DTensor {
        dispatch_dtensor!(self, |_T, f, inner| f(inner.reshape(IxDyn(&shape.dims))))
    }

    /// Little-endian bytes in standard (row-major) layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        fn branch<T: Pod>(tensor: &Tensor<T>) -> Vec<u8> {
            let standard = tensor.as_standard_layout();
            let slice = standard.as_slice().unwrap_or(&[]);
            bytemuck::cast_slice::<T, u8>(slice).to_vec()
        }
        dispatch_dtensor!(self, |_T, _f, inner| branch(inner))
    }

    pub fn from_bytes(dtype: DType, shape: &ConcreteShape, bytes: &[u8]) -> Result<DTensor, ByteLengthMismatch> {
        let expected = shape.size() * dtype.size().bytes();
        if bytes.len() != expected {
            return Err(ByteLengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        fn branch<T: Pod>(shape: &ConcreteShape, bytes: &[u8]) -> Tensor<T> {
            // the byte slice is not necessarily aligned for T, so copy element by element
            let data: Vec<T> = bytes
                .chunks_exact(std::mem::size_of::<T>())
                .map(bytemuck::pod_read_unaligned)
                .collect();
            Tensor::from_shape_vec(IxDyn(&shape.dims), data).expect("length checked above")
        }

        Ok(dispatch_dtype!(dtype, |T, f| f(branch::<T>(shape, bytes))))
    }

    pub fn unwrap_f32(&self) -> Option<&Tensor<f32>> {
        match self {
            DTensor::F32(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn unwrap_i32(&self) -> Option<&Tensor<i32>> {
        match self {
            DTensor::I32(tensor) => Some(tensor),
            _ => None,
        }
    }

    /// Convert any tensor to `f32`, used by kernels that compute in float.
    pub fn to_f32(&self) -> Tensor<f32> {
        match self {
            DTensor::F32(tensor) => tensor.clone(),
            DTensor::I8(tensor) => tensor.mapv(|x| x as f32).into_shared(),
            DTensor::I16(tensor) => tensor.mapv(|x| x as f32).into_shared(),
            DTensor::I32(tensor) => tensor.mapv(|x| x as f32).into_shared(),
            DTensor::I64(tensor) => tensor.mapv(|x| x as f32).into_shared(),
            DTensor::U8(tensor) => tensor.mapv(|x| x as f32).into_shared(),
            DTensor::U16(tensor) => tensor.mapv(|x| x as f32).into_shared(),
            DTensor::U32(tensor) => tensor.mapv(|x| x as f32).into_shared(),
            DTensor::U64(tensor) => tensor.mapv(|x| x as f32).into_shared(),
        }
    }

    /// Convert any integer tensor to `i64` indices. Returns `None` for float tensors.
    pub fn to_indices(&self) -> Option<Tensor<i64>> {
        let result = match self {
            DTensor::F32(_) => return None,
            DTensor::I8(tensor) => tensor.mapv(|x| x as i64),
            DTensor::I16(tensor) => tensor.mapv(|x| x as i64),
            DTensor::I32(tensor) => tensor.mapv(|x| x as i64),
            DTensor::I64(tensor) => tensor.mapv(|x| x),
            DTensor::U8(tensor) => tensor.mapv(|x| x as i64),
            DTensor::U16(tensor) => tensor.mapv(|x| x as i64),
            DTensor::U32(tensor) => tensor.mapv(|x| x as i64),
            DTensor::U64(tensor) => tensor.mapv(|x| x as i64),
        };
        Some(result.into_shared())
    }
}

impl Display for DTensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        dispatch_dtensor!(self, |_T, _f, inner| write!(f, "{}", inner))
    }
}

#[cfg(test)]
mod test {
    use ndarray::IxDyn;

    use crate::dtype::{DSize, DTensor, DType, Tensor};
    use crate::shape::ConcreteShape;

    #[test]
    fn dtype_codes_are_unique() {
        let all = [
            DType::F32,
            DType::I(DSize::S8),
            DType::I(DSize::S16),
            DType::I(DSize::S32),
            DType::I(DSize::S64),
            DType::U(DSize::S8),
            DType::U(DSize::S16),
            DType::U(DSize::S32),
            DType::U(DSize::S64),
        ];
        for dtype in all {
            assert_eq!(Some(dtype), DType::from_code(dtype.code()));
        }
        assert_eq!(None, DType::from_code(0x04));
        assert_eq!(None, DType::from_code(0x30));
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        let shape = ConcreteShape::new(vec![2, 3]);
        let err = DTensor::from_bytes(DType::F32, &shape, &[0; 20]).unwrap_err();
        assert_eq!(24, err.expected);
        assert_eq!(20, err.actual);
    }

    #[test]
    fn bytes_preserve_values() {
        let tensor = Tensor::from_shape_vec(IxDyn(&[2, 2]), vec![1, -2, 3, -4]).unwrap();
        let tensor = DTensor::I32(tensor);
        let bytes = tensor.to_bytes();
        assert_eq!(16, bytes.len());
        assert_eq!(&[0xfe, 0xff, 0xff, 0xff], &bytes[4..8]);

        let back = DTensor::from_bytes(DType::I32, &tensor.concrete_shape(), &bytes).unwrap();
        assert_eq!(tensor, back);
    }
}
