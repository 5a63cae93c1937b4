use crate::types::IndexSet;
use derive_more::Deref;
use rustc_hash::FxBuildHasher;
use thiserror::Error;

/// Misuse of a [`NutrientHeader`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HeaderError {
    /// The header lists a code twice.
    #[error("nutrient code {code} appears more than once")]
    DuplicateNutrientCode {
        /// Repeated code.
        code: String,
    },
    /// A nutrient code is not part of the header.
    #[error("unknown nutrient code {code}")]
    UnknownNutrientCode {
        /// Missing code.
        code: String,
    },
}

/// Fixed-dimension vector of nutrient amounts, one slot per nutrient code.
///
/// Densities are expressed per 100 grams; totals are produced with
/// [`NutrientTensor::scaled`].
#[derive(Debug, Clone, PartialEq, Deref)]
#[deref(forward)]
pub struct NutrientTensor(Box<[f64]>);

impl NutrientTensor {
    /// Wrap raw values.
    pub fn new(values: impl Into<Box<[f64]>>) -> Self {
        Self(values.into())
    }

    /// All-zero tensor of the given dimension.
    #[must_use]
    pub fn zeros(dimension: usize) -> Self {
        Self(vec![0.0; dimension].into_boxed_slice())
    }

    /// Number of nutrient slots.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// Elementwise product with `factor`.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        Self(self.0.iter().map(|v| v * factor).collect())
    }

    /// Position of the first non-finite value, if any.
    #[must_use]
    pub fn first_non_finite(&self) -> Option<usize> {
        self.0.iter().position(|v| !v.is_finite())
    }

    /// `self += weight * other`, elementwise.
    pub(crate) fn accumulate_weighted(&mut self, weight: f64, other: &Self) {
        debug_assert_eq!(self.dimension(), other.dimension());
        for (acc, value) in self.0.iter_mut().zip(other.0.iter()) {
            *acc += weight * value;
        }
    }

    pub(crate) fn scale_in_place(&mut self, factor: f64) {
        for value in &mut *self.0 {
            *value *= factor;
        }
    }

    /// Consume into the raw values.
    #[must_use]
    pub fn into_inner(self) -> Box<[f64]> {
        self.0
    }
}

impl From<Vec<f64>> for NutrientTensor {
    fn from(values: Vec<f64>) -> Self {
        Self(values.into_boxed_slice())
    }
}

impl<const N: usize> From<[f64; N]> for NutrientTensor {
    fn from(values: [f64; N]) -> Self {
        Self(Box::new(values))
    }
}

/// Process-wide mapping from nutrient code to tensor index.
///
/// Established once by the data loader; every tensor in a graph has exactly
/// `dimension()` slots laid out in header order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NutrientHeader {
    codes: IndexSet<Box<str>>,
}

impl NutrientHeader {
    /// Build a header from nutrient codes in column order.
    ///
    /// # Errors
    /// If a code appears twice.
    pub fn new<I, S>(codes: I) -> Result<Self, HeaderError>
    where
        I: IntoIterator<Item = S>,
        S: Into<Box<str>>,
    {
        let codes = codes.into_iter();
        let mut set = IndexSet::with_capacity_and_hasher(codes.size_hint().0, FxBuildHasher);
        for code in codes {
            let code = code.into();
            if set.contains(&code) {
                return Err(HeaderError::DuplicateNutrientCode {
                    code: code.into_string(),
                });
            }
            set.insert(code);
        }
        Ok(Self { codes: set })
    }

    /// Number of nutrients, i.e. the dimension of every tensor.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.codes.len()
    }

    /// Index of `code` in every tensor of the graph.
    #[must_use]
    pub fn index_of(&self, code: &str) -> Option<usize> {
        self.codes.get_index_of(code)
    }

    /// Nutrient codes in tensor order.
    pub fn codes(&self) -> impl ExactSizeIterator<Item = &str> + '_ {
        self.codes.iter().map(AsRef::as_ref)
    }

    /// Read the value of `code` out of `tensor`.
    #[must_use]
    pub fn value(&self, tensor: &NutrientTensor, code: &str) -> Option<f64> {
        tensor.get(self.index_of(code)?).copied()
    }

    /// Build a tensor from `(code, amount)` pairs; codes not mentioned are zero.
    ///
    /// # Errors
    /// If a code is not part of the header.
    pub fn tensor<'a>(
        &self,
        amounts: impl IntoIterator<Item = (&'a str, f64)>,
    ) -> Result<NutrientTensor, HeaderError> {
        let mut tensor = NutrientTensor::zeros(self.dimension());
        for (code, amount) in amounts {
            let idx = self
                .index_of(code)
                .ok_or_else(|| HeaderError::UnknownNutrientCode {
                    code: code.to_owned(),
                })?;
            tensor.0[idx] = amount;
        }
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_rejects_duplicate_codes() {
        let err = NutrientHeader::new(["calories", "protein", "calories"]).unwrap_err();
        assert_eq!(
            err,
            HeaderError::DuplicateNutrientCode {
                code: "calories".to_owned()
            }
        );
    }

    #[test]
    fn tensor_from_pairs_fills_missing_with_zero() {
        let header = NutrientHeader::new(["calories", "protein", "sodium"]).unwrap();
        let tensor = header.tensor([("sodium", 12.0), ("calories", 5.0)]).unwrap();
        assert_eq!(&*tensor, &[5.0, 0.0, 12.0]);
        assert_eq!(header.value(&tensor, "sodium"), Some(12.0));
        assert_eq!(header.value(&tensor, "fiber"), None);
        assert!(matches!(
            header.tensor([("fiber", 1.0)]),
            Err(HeaderError::UnknownNutrientCode { .. })
        ));
    }

    #[test]
    fn weighted_accumulation_and_scaling() {
        let mut acc = NutrientTensor::zeros(2);
        acc.accumulate_weighted(250.0, &NutrientTensor::from([5.0, 0.3]));
        acc.accumulate_weighted(50.0, &NutrientTensor::from([165.0, 31.0]));
        acc.scale_in_place(1.0 / 300.0);
        assert!((acc[0] - 31.666_666_666_666_668).abs() < 1e-9);
        assert!((acc[1] - 5.416_666_666_666_667).abs() < 1e-9);
        assert_eq!(&*NutrientTensor::from([1.0, 2.0]).scaled(3.0), &[3.0, 6.0]);
        assert_eq!(NutrientTensor::from([1.0, f64::NAN]).first_non_finite(), Some(1));
    }
}
