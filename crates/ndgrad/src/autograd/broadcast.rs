//! Shape-driven gradient rules for matrix products.
//!
//! For `C = A @ B` the rules are `dA = dC @ Bᵀ` and `dB = Aᵀ @ dC`, evaluated
//! on the promoted operand shapes of [`Size::matmul_plan`]. The upstream
//! gradient is first reshaped to the product shape (restoring axes removed
//! for vector operands); each operand gradient is then summed over the
//! batch axes it was broadcast along and reshaped to the operand's original
//! rank.
//!
//! Elementwise broadcasting needs no rule of its own: the operator
//! application wraps the gradient in a differentiable `sum_to`.

use super::value::AutogradValue;
use crate::error::Result;
use crate::payload::Payload;
use crate::size::Size;

pub(crate) fn matmul_lhs_grad<P: Payload>(
    g: &AutogradValue<P>,
    a: &AutogradValue<P>,
    b: &AutogradValue<P>,
) -> Result<AutogradValue<P>> {
    let a_size = a.size()?;
    let plan = Size::matmul_plan(&a_size, &b.size()?)?;
    let g = g.reshape(plan.product.clone())?;
    let bt = b.reshape(plan.rhs.clone())?.transpose()?;
    g.matmul(&bt)?.sum_to(plan.lhs)?.reshape(a_size)
}

pub(crate) fn matmul_rhs_grad<P: Payload>(
    g: &AutogradValue<P>,
    a: &AutogradValue<P>,
    b: &AutogradValue<P>,
) -> Result<AutogradValue<P>> {
    let b_size = b.size()?;
    let plan = Size::matmul_plan(&a.size()?, &b_size)?;
    let g = g.reshape(plan.product.clone())?;
    let at = a.reshape(plan.lhs.clone())?.transpose()?;
    at.matmul(&g)?.sum_to(plan.rhs)?.reshape(b_size)
}

#[cfg(test)]
mod tests {
    use crate::autograd::Registry;
    use crate::tensor::DenseTensor;
    use approx::assert_relative_eq;

    type Dense = DenseTensor<f64>;

    fn seq(shape: &[usize], start: f64) -> Dense {
        DenseTensor::from_fn(shape, |i| start + i as f64 * 0.25)
    }

    /// Central differences of `sum(a @ b)` with respect to every entry of
    /// the chosen operand.
    fn numeric(a: &Dense, b: &Dense, wrt_lhs: bool) -> Vec<f64> {
        use crate::operations::{matmul, sum};
        let h = 1e-6;
        let target = if wrt_lhs { a } else { b };
        (0..target.len())
            .map(|i| {
                let mut plus = target.clone();
                let mut minus = target.clone();
                plus.data_mut()[i] += h;
                minus.data_mut()[i] -= h;
                let f = |t: &Dense| {
                    let out = if wrt_lhs {
                        matmul(t, b).unwrap()
                    } else {
                        matmul(a, t).unwrap()
                    };
                    sum(&out)
                };
                (f(&plus) - f(&minus)) / (2.0 * h)
            })
            .collect()
    }

    fn check(lhs: &[usize], rhs: &[usize]) {
        let r = Registry::<Dense>::new("matmul-grad");
        let (pa, pb) = (seq(lhs, 0.5), seq(rhs, -1.0));
        let a = r.variable(pa.clone()).unwrap();
        let b = r.variable(pb.clone()).unwrap();
        a.matmul(&b).unwrap().sum().unwrap().backward().unwrap();

        let ga = a.grad().unwrap().unwrap();
        let gb = b.grad().unwrap().unwrap();
        assert_eq!(ga.size().unwrap().dims(), lhs);
        assert_eq!(gb.size().unwrap().dims(), rhs);
        for (x, y) in ga.to_vec().unwrap().iter().zip(numeric(&pa, &pb, true)) {
            assert_relative_eq!(*x, y, epsilon = 1e-5);
        }
        for (x, y) in gb.to_vec().unwrap().iter().zip(numeric(&pa, &pb, false)) {
            assert_relative_eq!(*x, y, epsilon = 1e-5);
        }
        r.close_all();
    }

    #[test]
    fn test_matrix_matrix() {
        check(&[2, 3], &[3, 4]);
    }

    #[test]
    fn test_vector_cases() {
        check(&[3], &[3]);
        check(&[3], &[3, 2]);
        check(&[2, 3], &[3]);
    }

    #[test]
    fn test_batched_cases() {
        // lhs batch only: flattened into one product
        check(&[4, 2, 3], &[3, 2]);
        // rhs batch only
        check(&[2, 3], &[4, 3, 2]);
        // broadcast batch prefixes
        check(&[2, 1, 2, 3], &[3, 3, 2]);
    }
}
