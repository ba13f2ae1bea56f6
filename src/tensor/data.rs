//! Host-side nested data for tensor ingestion
//!
//! `TensorData` abstracts over the nested slice/array/vec shapes users hand
//! to `to_tensor`. Implementations report a shape (validating that nested
//! rows are rectangular) and stream their elements as contiguous row-major
//! runs.

use crate::dims::Shape;
use crate::dtype::Element;
use crate::error::{Error, Result};
use smallvec::smallvec;

/// Nested host data convertible into a tensor
pub trait TensorData {
    /// Element type of the innermost level
    type Elem: Element;

    /// Shape of the nested structure; fails on ragged nesting
    fn shape(&self) -> Result<Shape>;

    /// Feed the elements to `f` as row-major contiguous runs
    fn visit(&self, f: &mut dyn FnMut(&[Self::Elem]) -> Result<()>) -> Result<()>;
}

impl<D: TensorData + ?Sized> TensorData for &D {
    type Elem = D::Elem;

    fn shape(&self) -> Result<Shape> {
        (**self).shape()
    }

    fn visit(&self, f: &mut dyn FnMut(&[Self::Elem]) -> Result<()>) -> Result<()> {
        (**self).visit(f)
    }
}

impl<T: Element> TensorData for [T] {
    type Elem = T;

    fn shape(&self) -> Result<Shape> {
        Ok(smallvec![self.len()])
    }

    fn visit(&self, f: &mut dyn FnMut(&[T]) -> Result<()>) -> Result<()> {
        f(self)
    }
}

impl<T: Element> TensorData for Vec<T> {
    type Elem = T;

    fn shape(&self) -> Result<Shape> {
        Ok(smallvec![self.len()])
    }

    fn visit(&self, f: &mut dyn FnMut(&[T]) -> Result<()>) -> Result<()> {
        f(self)
    }
}

impl<T: Element, const N: usize> TensorData for [T; N] {
    type Elem = T;

    fn shape(&self) -> Result<Shape> {
        Ok(smallvec![N])
    }

    fn visit(&self, f: &mut dyn FnMut(&[T]) -> Result<()>) -> Result<()> {
        f(self)
    }
}

impl<T: Element, const N: usize> TensorData for [[T; N]] {
    type Elem = T;

    fn shape(&self) -> Result<Shape> {
        Ok(smallvec![self.len(), N])
    }

    fn visit(&self, f: &mut dyn FnMut(&[T]) -> Result<()>) -> Result<()> {
        for row in self {
            f(row)?;
        }
        Ok(())
    }
}

impl<T: Element, const N: usize, const M: usize> TensorData for [[T; N]; M] {
    type Elem = T;

    fn shape(&self) -> Result<Shape> {
        Ok(smallvec![M, N])
    }

    fn visit(&self, f: &mut dyn FnMut(&[T]) -> Result<()>) -> Result<()> {
        for row in self {
            f(row)?;
        }
        Ok(())
    }
}

impl<T: Element> TensorData for Vec<Vec<T>> {
    type Elem = T;

    fn shape(&self) -> Result<Shape> {
        let inner = rectangular(self.iter().map(Vec::len))?;
        Ok(smallvec![self.len(), inner])
    }

    fn visit(&self, f: &mut dyn FnMut(&[T]) -> Result<()>) -> Result<()> {
        for row in self {
            f(row)?;
        }
        Ok(())
    }
}

impl<T: Element> TensorData for Vec<Vec<Vec<T>>> {
    type Elem = T;

    fn shape(&self) -> Result<Shape> {
        let middle = rectangular(self.iter().map(Vec::len))?;
        let inner = rectangular(self.iter().flatten().map(Vec::len))?;
        Ok(smallvec![self.len(), middle, inner])
    }

    fn visit(&self, f: &mut dyn FnMut(&[T]) -> Result<()>) -> Result<()> {
        for plane in self {
            for row in plane {
                f(row)?;
            }
        }
        Ok(())
    }
}

fn rectangular(mut lens: impl Iterator<Item = usize>) -> Result<usize> {
    let Some(first) = lens.next() else {
        return Err(Error::Shape {
            op: "to-tensor",
            reason: "nested data has an empty outer level".to_string(),
        });
    };
    for len in lens {
        if len != first {
            return Err(Error::Shape {
                op: "to-tensor",
                reason: format!("ragged nesting: expected rows of {first}, found {len}"),
            });
        }
    }
    Ok(first)
}
