//! Distribution math shared by the deciders.
//!
//! Everything here is a pure function of its inputs. Statistics that need a
//! minimum sample size return `Option` and yield `None` below it; callers
//! surface that as "undefined" rather than as a zero.
//!
//! The KS p-value (Kolmogorov asymptotic series) and the runs-test p-value
//! (normal approximation) are *approximations*; exact small-sample
//! distributions are not used.

use std::collections::BTreeSet;
use std::f64::consts::PI;

use rand::Rng;
use rand_distr::{Beta, Distribution};

/// Lower/upper clamp applied to p-values before any log/CDF work.
pub const P_VALUE_EPS: f64 = 1e-12;

/// Standard normal CDF. Uses `erfc` so the lower tail keeps relative precision.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * libm::erfc(-x / std::f64::consts::SQRT_2)
}

/// Standard normal quantile (Acklam's rational approximation, relative error
/// around 1e-9). Returns `±inf` at the closed ends and `NaN` outside `[0, 1]`.
pub fn normal_quantile(p: f64) -> f64 {
    if !(0.0..=1.0).contains(&p) || p.is_nan() {
        return f64::NAN;
    }
    if p == 0.0 {
        return f64::NEG_INFINITY;
    }
    if p == 1.0 {
        return f64::INFINITY;
    }

    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.024_25;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// Lanczos approximation of `ln Γ(x)` (g = 7, n = 9).
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    const G: f64 = 7.0;

    if x <= 0.0 {
        return f64::INFINITY;
    }
    if x < 0.5 {
        // Reflection.
        return PI.ln() - (PI * x).sin().abs().ln() - ln_gamma(1.0 - x);
    }
    let z = x - 1.0;
    let mut sum = COEFFS[0];
    for (i, &c) in COEFFS[1..].iter().enumerate() {
        sum += c / (z + i as f64 + 1.0);
    }
    let t = z + G + 0.5;
    0.5 * (2.0 * PI).ln() + (z + 0.5) * t.ln() - t + sum.ln()
}

/// Regularized incomplete beta `I_x(a, b)` via Lentz's continued fraction.
///
/// Returns `None` if the parameters are invalid or the fraction fails to
/// converge; callers decide their own fallback.
pub fn regularized_incomplete_beta(x: f64, a: f64, b: f64) -> Option<f64> {
    if !(a.is_finite() && b.is_finite()) || a <= 0.0 || b <= 0.0 || x.is_nan() {
        return None;
    }
    if x <= 0.0 {
        return Some(0.0);
    }
    if x >= 1.0 {
        return Some(1.0);
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    let out = if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(x, a, b)? / a
    } else {
        1.0 - front * beta_continued_fraction(1.0 - x, b, a)? / b
    };
    out.is_finite().then(|| out.clamp(0.0, 1.0))
}

fn beta_continued_fraction(x: f64, a: f64, b: f64) -> Option<f64> {
    const MAX_ITER: usize = 500;
    const EPS: f64 = 1e-15;
    const FPMIN: f64 = 1e-300;

    let guard = |v: f64| if v.abs() < FPMIN { FPMIN } else { v };

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 / guard(1.0 - qab * x / qap);
    let mut h = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < EPS {
            return Some(h);
        }
    }
    None
}

/// CDF of `Beta(a, b)` at `x`.
pub fn beta_cdf(x: f64, a: f64, b: f64) -> Option<f64> {
    regularized_incomplete_beta(x, a, b)
}

/// Draw one sample from `Beta(alpha, beta)`.
///
/// Degenerate parameters (non-finite or non-positive) yield the
/// uninformative midpoint `0.5` rather than an error.
pub fn sample_beta<R: Rng + ?Sized>(rng: &mut R, alpha: f64, beta: f64) -> f64 {
    if !(alpha.is_finite() && beta.is_finite()) || alpha <= 0.0 || beta <= 0.0 {
        return 0.5;
    }
    match Beta::new(alpha, beta) {
        Ok(dist) => dist.sample(rng),
        Err(_) => 0.5,
    }
}

/// Clamp a p-value into `[P_VALUE_EPS, 1 - P_VALUE_EPS]`.
#[inline]
pub fn clamp_p(p: f64) -> f64 {
    if p.is_nan() {
        0.5
    } else {
        p.clamp(P_VALUE_EPS, 1.0 - P_VALUE_EPS)
    }
}

/// Median of a slice (average of the two middle elements for even length).
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    let mid = v.len() / 2;
    Some(if v.len() % 2 == 0 {
        0.5 * (v[mid - 1] + v[mid])
    } else {
        v[mid]
    })
}

/// Result of a one-sample Kolmogorov–Smirnov test against `Uniform(0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct KsResult {
    /// `D = max(D+, D-)`.
    pub statistic: f64,
    /// Asymptotic p-value (Kolmogorov series with Stephens' correction).
    pub p_value: f64,
    pub n: usize,
}

/// Two-sided KS test of `values` against `Uniform(0, 1)`. Needs at least 3 samples.
pub fn ks_uniform(values: &[f64]) -> Option<KsResult> {
    let n = values.len();
    if n < 3 {
        return None;
    }
    let mut v: Vec<f64> = values.iter().map(|&x| clamp_p(x)).collect();
    v.sort_by(f64::total_cmp);
    let nf = n as f64;
    let mut d_plus = 0.0_f64;
    let mut d_minus = 0.0_f64;
    for (i, &x) in v.iter().enumerate() {
        let i = i as f64;
        d_plus = d_plus.max((i + 1.0) / nf - x);
        d_minus = d_minus.max(x - i / nf);
    }
    let d = d_plus.max(d_minus);
    let sqrt_n = nf.sqrt();
    let lambda = (sqrt_n + 0.12 + 0.11 / sqrt_n) * d;
    Some(KsResult {
        statistic: d,
        p_value: kolmogorov_survival(lambda),
        n,
    })
}

/// `Q_KS(λ) = 2 Σ_{j≥1} (-1)^{j-1} exp(-2 j² λ²)`.
///
/// Truncated at 100 terms or once a term drops below `1e-12`. If the series
/// has not settled within 100 terms (tiny λ), the survival is 1.
pub fn kolmogorov_survival(lambda: f64) -> f64 {
    if !lambda.is_finite() || lambda <= 0.0 {
        return 1.0;
    }
    let a2 = -2.0 * lambda * lambda;
    let mut fac = 2.0;
    let mut sum = 0.0;
    for j in 1..=100 {
        let j = j as f64;
        let term = fac * (a2 * j * j).exp();
        sum += term;
        if term.abs() < 1e-12 {
            return sum.clamp(0.0, 1.0);
        }
        fac = -fac;
    }
    1.0
}

/// Fraction of values that remain distinct after rounding to `precision`
/// decimals. Needs at least 2 samples.
pub fn unique_ratio(values: &[f64], precision: u32) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let scale = 10f64.powi(precision.min(15) as i32);
    let distinct: BTreeSet<i64> = values.iter().map(|&x| (x * scale).round() as i64).collect();
    Some(distinct.len() as f64 / values.len() as f64)
}

/// Shannon entropy (nats) of `values` binned into `bins` equal-width bins on
/// `[0, 1]`. Maximum is `ln(bins)`. Needs at least 2 samples.
pub fn binned_entropy(values: &[f64], bins: usize) -> Option<f64> {
    if values.len() < 2 || bins == 0 {
        return None;
    }
    let mut counts = vec![0u64; bins];
    for &x in values {
        let x = if x.is_nan() { 0.5 } else { x.clamp(0.0, 1.0) };
        let idx = ((x * bins as f64) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    let n = values.len() as f64;
    let hist: Vec<f64> = counts.iter().map(|&c| c as f64 / n).collect();
    logp::validate_simplex(&hist, 1e-9).ok()?;
    // Empty bins contribute 0 (the limit of p ln p).
    let h: f64 = hist
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| -p * p.ln())
        .sum();
    Some(h.clamp(0.0, (bins as f64).ln()))
}

/// Lag-1 sample autocorrelation. Needs at least 3 samples and non-zero variance.
pub fn lag1_autocorrelation(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 3 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let den: f64 = values.iter().map(|x| (x - mean).powi(2)).sum();
    if den <= f64::EPSILON {
        return None;
    }
    let num: f64 = values
        .windows(2)
        .map(|w| (w[0] - mean) * (w[1] - mean))
        .sum();
    Some((num / den).clamp(-1.0, 1.0))
}

/// Wald–Wolfowitz runs test around the sample median.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunsTest {
    pub runs: u64,
    pub expected_runs: f64,
    pub z: f64,
    /// Two-sided p-value (normal approximation).
    pub p_value: f64,
}

/// Runs test; values equal to the median are dropped. Needs at least 3
/// samples with both sides of the median populated.
pub fn runs_test(values: &[f64]) -> Option<RunsTest> {
    if values.len() < 3 {
        return None;
    }
    let med = median(values)?;
    let signs: Vec<bool> = values
        .iter()
        .filter(|&&x| x != med)
        .map(|&x| x > med)
        .collect();
    let n1 = signs.iter().filter(|&&s| s).count() as f64;
    let n2 = signs.len() as f64 - n1;
    if n1 == 0.0 || n2 == 0.0 {
        return None;
    }
    let runs = 1 + signs.windows(2).filter(|w| w[0] != w[1]).count() as u64;
    let n = n1 + n2;
    let expected = 2.0 * n1 * n2 / n + 1.0;
    let var = 2.0 * n1 * n2 * (2.0 * n1 * n2 - n) / (n * n * (n - 1.0));
    if !(var > 0.0) {
        return None;
    }
    let z = (runs as f64 - expected) / var.sqrt();
    let p_value = (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0);
    Some(RunsTest {
        runs,
        expected_runs: expected,
        z,
        p_value,
    })
}
