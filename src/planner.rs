use crate::kind::FitStrategy;
use std::fmt;

const SCALE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    ScaleUp,
    ScaleDown,
    NoScale,
}

impl ScaleDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ScaleDecision::ScaleUp => "SCALE_UP",
            ScaleDecision::ScaleDown => "SCALE_DOWN",
            ScaleDecision::NoScale => "NO_SCALE",
        }
    }
}

impl fmt::Display for ScaleDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resize decision for one image. `target_width`/`target_height` are the
/// dimensions of the content after applying `scale_factor`, not the canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalePlan {
    pub original_width: u32,
    pub original_height: u32,
    pub target_width: u32,
    pub target_height: u32,
    pub scale_factor: f64,
    pub decision: ScaleDecision,
}

impl ScalePlan {
    pub fn is_no_scale(&self) -> bool {
        self.decision == ScaleDecision::NoScale
    }
}

/// Scaling policy applied on top of the fit strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePolicy {
    pub allow_upscale: bool,
    pub allow_downscale: bool,
}

/// Computes the scale needed to fit or cover `canvas`, then clamps it to 1.0
/// when the policy forbids that direction.
///
/// Callers reject zero-area sources before planning.
pub fn plan(
    original: (u32, u32),
    canvas: (u32, u32),
    fit: FitStrategy,
    policy: ScalePolicy,
) -> ScalePlan {
    let (orig_w, orig_h) = original;
    let (canvas_w, canvas_h) = canvas;
    debug_assert!(orig_w > 0 && orig_h > 0, "zero-area source reached the planner");

    let scale_w = canvas_w as f64 / orig_w.max(1) as f64;
    let scale_h = canvas_h as f64 / orig_h.max(1) as f64;
    let needed = match fit {
        FitStrategy::Fit => scale_w.min(scale_h),
        FitStrategy::Cover => scale_w.max(scale_h),
    };

    let mut scale = needed;
    if (scale - 1.0).abs() <= SCALE_EPSILON {
        scale = 1.0;
    }
    if scale > 1.0 && !policy.allow_upscale {
        scale = 1.0;
    }
    if scale < 1.0 && !policy.allow_downscale {
        scale = 1.0;
    }

    let decision = if scale == 1.0 {
        ScaleDecision::NoScale
    } else if scale > 1.0 {
        ScaleDecision::ScaleUp
    } else {
        ScaleDecision::ScaleDown
    };

    let (target_width, target_height) = if decision == ScaleDecision::NoScale {
        (orig_w, orig_h)
    } else {
        (
            scaled_dimension(orig_w, scale),
            scaled_dimension(orig_h, scale),
        )
    };

    ScalePlan {
        original_width: orig_w,
        original_height: orig_h,
        target_width,
        target_height,
        scale_factor: scale,
        decision,
    }
}

fn scaled_dimension(value: u32, scale: f64) -> u32 {
    (value as f64 * scale).round().max(1.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALLOW_ALL: ScalePolicy = ScalePolicy {
        allow_upscale: true,
        allow_downscale: true,
    };

    #[test]
    fn fit_upscale_matches_canvas() {
        let plan = plan((100, 50), (200, 100), FitStrategy::Fit, ALLOW_ALL);
        assert_eq!(plan.decision, ScaleDecision::ScaleUp);
        assert_eq!((plan.target_width, plan.target_height), (200, 100));
        assert_eq!(plan.scale_factor, 2.0);
    }

    #[test]
    fn fit_uses_limiting_side() {
        let plan = plan((1600, 400), (800, 310), FitStrategy::Fit, ALLOW_ALL);
        assert_eq!(plan.decision, ScaleDecision::ScaleDown);
        assert_eq!((plan.target_width, plan.target_height), (800, 200));
    }

    #[test]
    fn cover_fills_both_sides() {
        let plan = plan((400, 400), (1000, 562), FitStrategy::Cover, ALLOW_ALL);
        assert_eq!(plan.decision, ScaleDecision::ScaleUp);
        assert!(plan.target_width >= 1000);
        assert!(plan.target_height >= 562);
    }

    #[test]
    fn upscale_disallowed_clamps_to_no_scale() {
        let policy = ScalePolicy {
            allow_upscale: false,
            allow_downscale: true,
        };
        let plan = plan((300, 100), (1000, 562), FitStrategy::Cover, policy);
        assert_eq!(plan.decision, ScaleDecision::NoScale);
        assert_eq!(plan.scale_factor, 1.0);
        assert_eq!((plan.target_width, plan.target_height), (300, 100));
    }

    #[test]
    fn downscale_disallowed_clamps_to_no_scale() {
        let policy = ScalePolicy {
            allow_upscale: true,
            allow_downscale: false,
        };
        for (w, h) in [(4000, 3000), (2001, 1081), (10_000, 10)] {
            let plan = plan((w, h), (1920, 1080), FitStrategy::Fit, policy);
            assert_eq!(plan.decision, ScaleDecision::NoScale);
            assert_eq!(plan.scale_factor, 1.0);
        }
    }

    #[test]
    fn larger_source_without_upscale_still_downscales() {
        let policy = ScalePolicy {
            allow_upscale: false,
            allow_downscale: true,
        };
        let plan = plan((3840, 2160), (1920, 1080), FitStrategy::Cover, policy);
        assert_eq!(plan.decision, ScaleDecision::ScaleDown);
        assert_eq!((plan.target_width, plan.target_height), (1920, 1080));
    }

    #[test]
    fn exact_size_is_no_scale_even_when_everything_is_forbidden() {
        let policy = ScalePolicy {
            allow_upscale: false,
            allow_downscale: false,
        };
        let cover = plan((1000, 562), (1000, 562), FitStrategy::Cover, policy);
        assert_eq!(cover.decision, ScaleDecision::NoScale);
        let fit = plan((1000, 562), (1000, 562), FitStrategy::Fit, ALLOW_ALL);
        assert!(fit.is_no_scale());
    }

    #[test]
    fn decision_and_factor_agree() {
        for original in [(1, 1), (37, 999), (1920, 1080), (5000, 20), (256, 256)] {
            for fit in [FitStrategy::Fit, FitStrategy::Cover] {
                let plan = plan(original, (256, 256), fit, ALLOW_ALL);
                assert_eq!(plan.is_no_scale(), plan.scale_factor == 1.0);
            }
        }
    }
}
