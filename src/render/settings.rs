use serde::{Deserialize, Serialize};

/// Declares a fieldless enum that the GUI can list in a combo box.
macro_rules! modes {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $label:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[serde(rename_all = "snake_case")]
        #[repr(u32)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }
    };
}

modes! {
    pub enum Integrator {
        Geometry => "Geometry",
        Shading => "Shading",
        AmbientOcclusion => "Ambient Occlusion",
        MaterialPath => "Material Path",
    }
}

modes! {
    /// What the geometry integrator visualizes.
    pub enum GeometryMode {
        Barycentric => "Barycentric",
        LocalPosition => "Local Position",
        LocalGeometricNormal => "Local Geometric Normal",
        LocalShadingNormal => "Local Shading Normal",
        GeometryIndex => "Geometry Index",
        InstanceCustomIndex => "Instance Custom Index",
        PrimitiveId => "Primitive Id",
        ShapeId => "Shape Id",
        WorldPosition => "World Position",
        WorldGeometricNormal => "World Geometric Normal",
        WorldShadingNormal => "World Shading Normal",
        Uv => "UV",
        LocalTangent => "Local Tangent",
        WorldTangent => "World Tangent",
        LocalBitangent => "Local Bitangent",
        WorldBitangent => "World Bitangent",
        WorldNWarp => "World N Warp",
        WorldTnbWarp => "World TNB Warp",
        WorldNormalMesh => "World Normal Mesh",
        WorldTangentMesh => "World Tangent Mesh",
        FlipBitangent => "Flip Bitangent",
        TraverseTime => "Traverse Time",
    }
}

modes! {
    /// What the shading integrator visualizes.
    pub enum ShadingMode {
        MaterialId => "Material Id",
        MaterialType => "Material Type",
        GeometryDivergence => "Geometry Divergence",
        MaterialDivergence => "Material Divergence",
        ActiveLanes => "Active Lanes",
        AlphaMask => "Alpha Mask",
        Texture0 => "Texture 0",
        Texture1 => "Texture 1",
        Texture2 => "Texture 2",
        Texture3 => "Texture 3",
        Texture4 => "Texture 4",
        Texture5 => "Texture 5",
        Texture6 => "Texture 6",
        Texture7 => "Texture 7",
        Texture8 => "Texture 8",
        Texture9 => "Texture 9",
        Texture10 => "Texture 10",
        Texture11 => "Texture 11",
        Param0 => "Param 0",
        Param1 => "Param 1",
        Param2 => "Param 2",
        Param3 => "Param 3",
    }
}

modes! {
    pub enum Tonemap {
        Uncharted2 => "Uncharted 2",
        UnrealTournament => "Unreal Tournament",
        Exponential => "Exponential",
    }
}

/// Every renderer parameter. Persisted as part of the config file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub integrator: Integrator,
    pub geometry_mode: GeometryMode,
    pub shading_mode: ShadingMode,
    /// Upper bound of concurrent upload tasks per phase
    pub max_parallelism: usize,
    pub max_depth: u32,
    pub max_stationary_frames: u32,
    pub tonemap: Tonemap,
    pub gamma: f32,
    pub exposure: f32,
    pub sun: f32,
    pub suppress_fireflies: u32,
    pub samples_per_frame: u32,
    pub accumulate: bool,
    pub shading_normals: bool,
    pub hdr: bool,
    pub roulette: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            integrator: Integrator::MaterialPath,
            geometry_mode: GeometryMode::Barycentric,
            shading_mode: ShadingMode::MaterialId,
            max_parallelism: 32,
            max_depth: 16,
            max_stationary_frames: 100_000,
            tonemap: Tonemap::Exponential,
            gamma: 2.2,
            exposure: 1.0,
            sun: 1.0,
            suppress_fireflies: 0,
            samples_per_frame: 1,
            accumulate: true,
            shading_normals: true,
            hdr: false,
            roulette: true,
        }
    }
}

impl Settings {
    /// Whether switching to `next` changes what is traced. Display only parameters, like the
    /// tonemap, keep the accumulated samples.
    pub fn resets_accumulation(&self, next: &Settings) -> bool {
        self.integrator != next.integrator
            || (next.integrator == Integrator::Geometry
                && self.geometry_mode != next.geometry_mode)
            || (next.integrator == Integrator::Shading && self.shading_mode != next.shading_mode)
            || self.hdr != next.hdr
            || self.shading_normals != next.shading_normals
            || self.roulette != next.roulette
            || self.samples_per_frame != next.samples_per_frame
            || self.suppress_fireflies != next.suppress_fireflies
            || self.max_depth != next.max_depth
            || self.sun != next.sun
    }
}

impl Integrator {
    /// Integrators that converge over frames and stop tracing once they have.
    pub fn is_progressive(self) -> bool {
        matches!(self, Integrator::AmbientOcclusion | Integrator::MaterialPath)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_lists_match_the_shaders() {
        assert_eq!(GeometryMode::ALL.len(), 22);
        assert_eq!(ShadingMode::ALL.len(), 22);
        assert_eq!(GeometryMode::TraverseTime as u32, 21);
        assert_eq!(ShadingMode::Texture0 as u32, 6);
        assert_eq!(ShadingMode::Param3 as u32, 21);
    }

    #[test]
    fn display_parameters_keep_accumulation() {
        let settings = Settings::default();
        let tonemapped = Settings {
            tonemap: Tonemap::Uncharted2,
            gamma: 1.0,
            exposure: 4.0,
            max_stationary_frames: 10,
            ..settings.clone()
        };
        assert!(!settings.resets_accumulation(&tonemapped));

        let deeper = Settings {
            max_depth: 4,
            ..settings.clone()
        };
        assert!(settings.resets_accumulation(&deeper));

        let switched = Settings {
            integrator: Integrator::Geometry,
            ..settings.clone()
        };
        assert!(settings.resets_accumulation(&switched));

        // Modes of an inactive integrator do not matter.
        let shading_mode = Settings {
            shading_mode: ShadingMode::AlphaMask,
            ..settings.clone()
        };
        assert!(!settings.resets_accumulation(&shading_mode));
    }

    #[test]
    fn settings_serialize_in_snake_case() {
        let json = serde_json::to_string(&Settings::default()).unwrap();
        assert!(json.contains(r#""integrator":"material_path""#));
        assert!(json.contains(r#""tonemap":"exponential""#));

        let settings: Settings =
            serde_json::from_str(r#"{ "integrator": "ambient_occlusion", "gamma": 1.8 }"#)
                .unwrap();
        assert_eq!(settings.integrator, Integrator::AmbientOcclusion);
        assert_eq!(settings.gamma, 1.8);
        assert_eq!(settings.max_depth, 16);
    }
}
