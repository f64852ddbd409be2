use super::settings::{Integrator, Settings, Tonemap};

/// Operation of the post processing compute shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PostOp {
    None,
    ToLinear,
    ToSrgb,
    TonemapU2,
    TonemapUt,
    TonemapExp,
    TonemapU2Srgb,
    TonemapUtSrgb,
    TonemapExpSrgb,
}

/// Picks the post operation for the current settings.
///
/// `srgb_output` is set when the result is written to an 8 bit image instead of being
/// displayed.
pub fn postprocess_op(settings: &Settings, srgb_output: bool) -> PostOp {
    let pick = |srgb, linear| if srgb_output { srgb } else { linear };
    match settings.integrator {
        Integrator::Geometry | Integrator::Shading => pick(PostOp::None, PostOp::ToLinear),
        Integrator::AmbientOcclusion | Integrator::MaterialPath if settings.hdr => {
            pick(PostOp::ToSrgb, PostOp::None)
        }
        Integrator::AmbientOcclusion | Integrator::MaterialPath => match settings.tonemap {
            Tonemap::Uncharted2 => pick(PostOp::TonemapU2Srgb, PostOp::TonemapU2),
            Tonemap::UnrealTournament => pick(PostOp::TonemapUtSrgb, PostOp::TonemapUt),
            Tonemap::Exponential => pick(PostOp::TonemapExpSrgb, PostOp::TonemapExp),
        },
    }
}

/// Workgroups covering `width` x `height` pixels with 8x8 groups.
pub fn dispatch_groups(width: u32, height: u32) -> [u32; 3] {
    [(width + 7) / 8, (height + 7) / 8, 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(integrator: Integrator, hdr: bool, tonemap: Tonemap) -> Settings {
        Settings {
            integrator,
            hdr,
            tonemap,
            ..Default::default()
        }
    }

    #[test]
    fn visualizations_are_not_tonemapped() {
        for integrator in [Integrator::Geometry, Integrator::Shading] {
            let settings = settings(integrator, true, Tonemap::Uncharted2);
            assert_eq!(postprocess_op(&settings, true), PostOp::None);
            assert_eq!(postprocess_op(&settings, false), PostOp::ToLinear);
        }
    }

    #[test]
    fn hdr_skips_the_tonemap() {
        let settings = settings(Integrator::MaterialPath, true, Tonemap::Exponential);
        assert_eq!(postprocess_op(&settings, true), PostOp::ToSrgb);
        assert_eq!(postprocess_op(&settings, false), PostOp::None);
    }

    #[test]
    fn tonemap_variants() {
        let cases = [
            (Tonemap::Uncharted2, PostOp::TonemapU2, PostOp::TonemapU2Srgb),
            (Tonemap::UnrealTournament, PostOp::TonemapUt, PostOp::TonemapUtSrgb),
            (Tonemap::Exponential, PostOp::TonemapExp, PostOp::TonemapExpSrgb),
        ];
        for (tonemap, linear, srgb) in cases {
            let settings = settings(Integrator::AmbientOcclusion, false, tonemap);
            assert_eq!(postprocess_op(&settings, false), linear);
            assert_eq!(postprocess_op(&settings, true), srgb);
        }
        assert_eq!(PostOp::TonemapExpSrgb as u32, 8);
    }

    #[test]
    fn groups_round_up() {
        assert_eq!(dispatch_groups(1280, 720), [160, 90, 1]);
        assert_eq!(dispatch_groups(9, 1), [2, 1, 1]);
    }
}
