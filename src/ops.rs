// ----------------------------------------------------------------------------
// neural net blocks; the dynamics of the Transformer
use num_traits::{Float, Zero};
use rand::{
    distributions::{Distribution, Standard},
    Rng,
};
use std::ops::{AddAssign, DivAssign, MulAssign, SubAssign};

const SQRT_2_INV: f32 = std::f32::consts::FRAC_1_SQRT_2;
const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEFF: f32 = 0.044715;

pub fn layernorm(o: &mut [f32], x: &[f32], weight: &[f32], bias: &[f32], eps: f32) {
    debug_assert!(o.len() == x.len());
    // calculate mean and variance
    let n = x.len() as f32;
    let mean = x.iter().sum::<f32>() / n;
    let mut var = 0.0f32;
    for v in x {
        var += (v - mean) * (v - mean);
    }
    var /= n;
    let inv_std = 1.0f32 / (var + eps).sqrt();
    // normalize, scale and shift
    for j in 0..x.len() {
        o[j] = (x[j] - mean) * inv_std * weight[j] + bias[j];
    }
}

pub fn matmul(xout: &mut [f32], x: &[f32], w: &[f32]) {
    // W (d,n) @ x (n,) -> xout (d,)
    // by far the most amount of time is spent inside this little function
    let n = x.len();
    debug_assert!(w.len() == xout.len() * n);
    for i in 0..xout.len() {
        let mut val = 0.0f32;
        for j in 0..n {
            val += w[i * n + j] * x[j];
        }
        xout[i] = val;
    }
}

/// `matmul` followed by an optional bias add.
pub fn linear(xout: &mut [f32], x: &[f32], w: &[f32], bias: Option<&[f32]>) {
    matmul(xout, x, w);
    if let Some(b) = bias {
        accum(xout, b);
    }
}

pub fn softmax<T: Float + AddAssign + DivAssign>(x: &mut [T]) {
    // find max value (for numerical stability)
    let mut max_val = x[0];
    for i in 1..x.len() {
        if x[i] > max_val {
            max_val = x[i];
        }
    }
    // exp and sum
    let mut sum = T::zero();
    for i in 0..x.len() {
        x[i] = (x[i] - max_val).exp();
        sum += x[i];
    }
    // normalize
    for i in 0..x.len() {
        x[i] /= sum;
    }
}

pub fn accum<T: AddAssign + Copy>(a: &mut [T], b: &[T]) {
    debug_assert!(a.len() == b.len());
    for (ai, bi) in a.iter_mut().zip(b.iter()) {
        *ai += *bi;
    }
}

pub fn dotprod<T: AddAssign + Float>(a: &[T], b: &[T]) -> T {
    debug_assert!(a.len() == b.len());
    let mut v: T = Zero::zero();
    for (ai, bi) in a.iter().zip(b.iter()) {
        v += (*ai) * (*bi);
    }
    v
}

/// o += a * v
pub fn axpy(o: &mut [f32], a: f32, v: &[f32]) {
    debug_assert!(o.len() == v.len());
    for (oi, vi) in o.iter_mut().zip(v.iter()) {
        *oi += a * vi;
    }
}

/// exact gelu: 0.5 * x * (1 + erf(x / sqrt(2)))
pub fn gelu(x: &mut [f32]) {
    for xi in x.iter_mut() {
        *xi = 0.5 * *xi * (1.0 + libm::erff(*xi * SQRT_2_INV));
    }
}

/// tanh approximated gelu ("gelu_pytorch_tanh")
pub fn gelu_tanh(x: &mut [f32]) {
    for xi in x.iter_mut() {
        let v = *xi;
        let inner = SQRT_2_OVER_PI * (v + GELU_COEFF * v * v * v);
        *xi = 0.5 * v * (1.0 + libm::tanhf(inner));
    }
}

pub fn relu<T: Float>(x: &mut [T]) {
    for xi in x.iter_mut() {
        *xi = xi.max(T::zero());
    }
}

/// F.silu; silu(x)=x*σ(x), where σ(x) is the logistic sigmoid
pub fn silu<T: MulAssign + Float>(x: &mut [T]) {
    for xi in x.iter_mut() {
        let one = T::one();
        *xi *= one / (one + (-(*xi)).exp());
    }
}

pub fn sample<T: Float + SubAssign>(a: &[T], rng: &mut impl Rng) -> usize
where
    Standard: Distribution<T>,
{
    debug_assert!(!a.is_empty());
    let mut v: T = rng.gen();
    for (i, ai) in a.iter().enumerate() {
        if v <= *ai {
            return i;
        }
        v -= *ai;
    }
    a.len() - 1
}

pub fn argmax<T: Float>(a: &[T]) -> usize {
    let mut max_idx: usize = 0;
    let mut max = T::neg_infinity();
    for (i, ai) in a.iter().enumerate() {
        if *ai > max {
            max = *ai;
            max_idx = i;
        }
    }
    max_idx
}

pub fn logits_to_prob<T: Float + DivAssign + AddAssign>(logits: &mut [T], temperature: T) {
    logits.iter_mut().for_each(|v| {
        *v /= temperature;
    });
    // apply softmax to the logits to get the probabilities for next token
    softmax(logits);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_layernorm_zero_mean_unit_var() {
        let x = [1.0f32, 2.0, 3.0, 4.0];
        let mut o = [0f32; 4];
        layernorm(&mut o, &x, &[1.0; 4], &[0.0; 4], 0.0);
        let mean: f32 = o.iter().sum::<f32>() / 4.0;
        let var: f32 = o.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_layernorm_bias_shift() {
        let x = [3.0f32, 3.0];
        let mut o = [0f32; 2];
        layernorm(&mut o, &x, &[2.0, 2.0], &[0.5, -0.5], 1e-5);
        assert_eq!(o, [0.5, -0.5]);
    }

    #[test]
    fn test_linear_with_bias() {
        // [[1, 2], [3, 4], [5, 6]] @ [1, 1] + [0.5, 0.5, 0.5]
        let w = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = [0f32; 3];
        linear(&mut out, &[1.0, 1.0], &w, Some(&[0.5, 0.5, 0.5]));
        assert_eq!(out, [3.5, 7.5, 11.5]);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut x = [1.0f32, 2.0, 3.0];
        softmax(&mut x);
        assert!((x.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(x[2] > x[1] && x[1] > x[0]);
    }

    #[test]
    fn test_gelu_variants_close() {
        let mut exact = [-2.0f32, -0.5, 0.0, 0.5, 2.0];
        let mut approx = exact;
        gelu(&mut exact);
        gelu_tanh(&mut approx);
        assert_eq!(exact[2], 0.0);
        assert!((exact[4] - 1.9545).abs() < 1e-3);
        for (e, a) in exact.iter().zip(approx.iter()) {
            assert!((e - a).abs() < 1e-3);
        }
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.3f32, 0.8, 0.2]), 1);
    }
}
