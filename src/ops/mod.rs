//! Math operation vocabulary and the per-stream backend table
//!
//! The dispatch layer (see [`dispatch`]) validates shapes, aliasing, and
//! dtypes, then hands fully-checked work to the destination stream's
//! [`MathBackend`] implementation. Backends see only buffers, dimension
//! descriptors, and scale factors; every structural error has already been
//! rejected by the time a launch method runs.

mod dispatch;

pub use dispatch::{binary, fill_random, gemm, reduce, ternary_select, unary, Operand};

use crate::dims::Dims;
use crate::driver::Buffer;
use crate::error::Result;
use std::sync::Arc;

/// Elementwise unary operations: `dest = f(alpha * x)`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    /// Largest integer not above the value
    Floor,
    /// Smallest integer not below the value
    Ceil,
    /// Nearest integer, half away from zero
    Round,
    /// Negation
    Negate,
    /// Hyperbolic tangent
    Tanh,
    /// Logistic sigmoid `1 / (1 + e^-v)`
    Logistic,
    /// Natural exponential
    Exp,
    /// Square root
    Sqrt,
    /// Identity (used for fills, compaction, and scaled copies)
    Noop,
}

/// Elementwise binary operations: `dest = (alpha * x) op (beta * y)`
///
/// Comparison operations write 1 or 0 in the destination dtype.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division
    Div,
    /// Elementwise maximum
    Max,
    /// Elementwise minimum
    Min,
    /// Bitwise and (integer dtypes, unit scales)
    BitAnd,
    /// Bitwise xor (integer dtypes, unit scales)
    BitXor,
    /// Equality test
    Eq,
    /// Greater-than test
    Gt,
    /// Greater-or-equal test
    Ge,
    /// Less-than test
    Lt,
    /// Less-or-equal test
    Le,
}

impl BinaryOp {
    /// Operations restricted to integer dtypes with unit scale factors
    pub fn is_bitwise(self) -> bool {
        matches!(self, Self::BitAnd | Self::BitXor)
    }
}

/// Last-axis reductions: `dest = reduce(alpha * input)`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    /// Maximum element
    Max,
    /// Minimum element
    Min,
    /// Sum of elements
    Sum,
    /// Arithmetic mean
    Mean,
    /// Sum of squares
    MagnitudeSquared,
    /// Euclidean norm
    Magnitude,
}

/// Sampling distributions for `fill_random` (f32 destinations only)
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Distribution {
    /// Normal distribution with the given mean and variance
    Gaussian {
        /// Distribution mean
        mean: f64,
        /// Distribution variance
        variance: f64,
    },
    /// Uniform distribution over `[min, max)`
    Flat {
        /// Inclusive lower bound
        min: f64,
        /// Exclusive upper bound
        max: f64,
    },
}

/// A checked operand handed to a backend: buffer, view, and scale factor
///
/// The view's shape is commensurate with the destination's; backends walk
/// smaller operands with modular indexing per axis.
#[derive(Clone)]
pub struct OperandView {
    /// Backing buffer (kept alive for the duration of the launch)
    pub buffer: Arc<dyn Buffer>,
    /// View of the buffer
    pub dims: Dims,
    /// Scale factor applied to each element on read
    pub scale: f64,
}

/// Canonicalized gemm launch: `C = alpha * opA(A) * opB(B) + beta * C`
///
/// Operands are canonical by construction: stored matrices are
/// access-increasing with unit element stride, and any in-place transposed
/// input has been folded into its `trans_*` flag. `m`/`k`/`n` describe the
/// *logical* (post-transpose) operand shapes; `ld*` are the stored leading
/// dimensions.
pub struct GemmArgs {
    /// Destination matrix buffer
    pub c: Arc<dyn Buffer>,
    /// Element offset of C's first element
    pub c_offset: usize,
    /// Leading dimension of C
    pub ldc: usize,
    /// Whether A is transposed
    pub trans_a: bool,
    /// Whether B is transposed
    pub trans_b: bool,
    /// Scale applied to the product
    pub alpha: f64,
    /// Left operand buffer
    pub a: Arc<dyn Buffer>,
    /// Element offset of A's first element
    pub a_offset: usize,
    /// Rows of opA(A) and of C
    pub m: usize,
    /// Columns of opA(A), rows of opB(B)
    pub k: usize,
    /// Leading dimension of A as stored
    pub lda: usize,
    /// Right operand buffer
    pub b: Arc<dyn Buffer>,
    /// Element offset of B's first element
    pub b_offset: usize,
    /// Columns of opB(B) and of C
    pub n: usize,
    /// Leading dimension of B as stored
    pub ldb: usize,
    /// Scale applied to the existing C contents
    pub beta: f64,
}

/// Per-stream implementation table for the math operations
///
/// Implemented by every [`crate::driver::Stream`]. Launch methods enqueue
/// onto the stream and return immediately; arguments arrive fully
/// validated.
pub trait MathBackend: Send + Sync {
    /// `dest = f(alpha * x)`
    fn launch_unary(&self, dest: &OperandView, op: UnaryOp, x: &OperandView) -> Result<()>;

    /// `dest = (alpha * x) op (beta * y)`
    fn launch_binary(
        &self,
        dest: &OperandView,
        op: BinaryOp,
        x: &OperandView,
        y: &OperandView,
    ) -> Result<()>;

    /// `dest = (alpha * x) >= 0 ? (beta * y) : (gamma * z)`
    fn launch_ternary_select(
        &self,
        dest: &OperandView,
        x: &OperandView,
        y: &OperandView,
        z: &OperandView,
    ) -> Result<()>;

    /// Reduce `alpha * x` along its last axis into `dest`
    fn launch_reduce(&self, dest: &OperandView, op: ReduceOp, x: &OperandView) -> Result<()>;

    /// Canonical BLAS-shaped matrix multiply
    fn launch_gemm(&self, args: GemmArgs) -> Result<()>;

    /// Overwrite `dest` with samples from `dist`
    fn launch_fill_random(&self, dest: &OperandView, dist: Distribution) -> Result<()>;
}
