//! Element-wise activations and their derivatives.

use crate::api::types::Activation;

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEF: f32 = 0.044_715;

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl Activation {
    /// `f(x)`
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Identity => x,
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.max(0.0),
            Activation::Gelu => {
                // tanh approximation
                0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + GELU_COEF * x * x * x)).tanh())
            }
            Activation::Silu => x * sigmoid(x),
        }
    }

    /// `f'(x)` given the pre-activation `x` and the output `y = f(x)`.
    #[inline]
    pub fn derivative(self, x: f32, y: f32) -> f32 {
        match self {
            Activation::Identity => 1.0,
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Tanh => 1.0 - y * y,
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Gelu => {
                let inner = SQRT_2_OVER_PI * (x + GELU_COEF * x * x * x);
                let t = inner.tanh();
                let d_inner = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEF * x * x);
                0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
            }
            Activation::Silu => {
                let s = sigmoid(x);
                s + x * s * (1.0 - s)
            }
        }
    }

    /// `y = f(z)` element-wise.
    pub fn forward(self, z: &[f32], y: &mut [f32]) {
        for (yi, &zi) in y.iter_mut().zip(z.iter()) {
            *yi = self.apply(zi);
        }
    }

    /// `dz = dy * f'(z)` element-wise.
    pub fn backward(self, z: &[f32], y: &[f32], dy: &[f32], dz: &mut [f32]) {
        for i in 0..dz.len() {
            dz[i] = dy[i] * self.derivative(z[i], y[i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivatives_match_finite_difference() {
        let h = 1e-3f32;
        for act in [
            Activation::Sigmoid,
            Activation::Tanh,
            Activation::Gelu,
            Activation::Silu,
            Activation::Identity,
        ] {
            for &x in &[-2.0f32, -0.3, 0.4, 1.7] {
                let numeric = (act.apply(x + h) - act.apply(x - h)) / (2.0 * h);
                let analytic = act.derivative(x, act.apply(x));
                assert!((numeric - analytic).abs() < 1e-2, "{:?} at {}: {} vs {}", act, x, numeric, analytic);
            }
        }
    }

    #[test]
    fn test_sigmoid_extremes_are_finite() {
        assert_eq!(sigmoid(-1000.0), 0.0);
        assert_eq!(sigmoid(1000.0), 1.0);
    }
}
