//! Material parsing and cache tests.
//!
//! Covers:
//! - Interning by (name, lightmap index) and the default-material fallbacks
//! - Stage grammar: blends, generators, implicit rewrites
//! - Finalize invariants: active stage prefix, sort derivation, lightmap
//!   stage collapse
//! - Remapping, skins and the malformed-shader-file recovery

mod common;

use common::{png_bytes, SharedDevice};
use strafe::gpu::GraphicsDevice;
use strafe::interface::MemoryHost;
use strafe::material::parse::ParseContext;
use strafe::material::{
    sort, AlphaGen, ColorGen, MaterialCache, MaterialLightmapId, TexCoordGen,
};
use strafe::scene::SunLight;
use strafe::texture::TextureCache;

struct Fixture {
    device: SharedDevice,
    host: MemoryHost,
    textures: TextureCache,
    sun: SunLight,
}

impl Fixture {
    fn new(shader_text: &str) -> Fixture {
        let mut host = MemoryHost::new();

        if !shader_text.is_empty() {
            host.add_file("scripts/test.shader", shader_text.as_bytes().to_vec());
        }

        host.add_file("textures/test/image.png", png_bytes(8, 8, [200, 100, 50, 255]));

        let mut device = SharedDevice::new();
        let textures = TextureCache::new(&mut device, 0, 0.5).unwrap();

        Fixture {
            device,
            host,
            textures,
            sun: SunLight::default(),
        }
    }

    fn cache(&mut self) -> MaterialCache {
        let mut ctx = self.ctx();
        MaterialCache::new(&mut ctx)
    }

    fn ctx(&mut self) -> ParseContext<'_> {
        ParseContext {
            device: &mut self.device,
            host: &self.host,
            textures: &mut self.textures,
            lightmaps: &[],
            sun: &mut self.sun,
            overbright_factor: 2.0,
        }
    }
}

// ============================================================================
// Interning and fallbacks
// ============================================================================

#[test]
fn empty_name_returns_default_material() {
    let mut fixture = Fixture::new("");
    let mut cache = fixture.cache();
    let index = cache
        .find_material("", MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .unwrap();
    assert_eq!(index, cache.default_material());
}

#[test]
fn long_name_is_rejected() {
    let mut fixture = Fixture::new("");
    let mut cache = fixture.cache();
    let name = "x".repeat(65);
    assert!(cache
        .find_material(&name, MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .is_none());
}

#[test]
fn find_material_interns() {
    let mut fixture = Fixture::new("");
    let mut cache = fixture.cache();
    let a = cache
        .find_material("textures/test/image", MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .unwrap();
    let b = cache
        .find_material("textures/test/image", MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .unwrap();
    assert_eq!(a, b);

    // Extension and case are stripped from the key.
    let c = cache
        .find_material("textures/test/IMAGE.png", MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .unwrap();
    assert_eq!(a, c);
}

#[test]
fn missing_image_becomes_default_shader() {
    let mut fixture = Fixture::new("");
    let mut cache = fixture.cache();
    let index = cache
        .find_material("textures/test/missing", MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .unwrap();
    assert!(cache.material(index).default_shader);

    // The miss is interned: a second lookup with another lightmap index
    // still finds it.
    let again = cache
        .find_material("textures/test/missing", 3, true, &mut fixture.ctx())
        .unwrap();
    assert_eq!(index, again);
}

// ============================================================================
// Fallback synthesis by lightmap id
// ============================================================================

#[test]
fn synthesis_for_stretch_pic() {
    use wgpu::BlendFactor as BF;

    let mut fixture = Fixture::new("");
    let mut cache = fixture.cache();
    let index = cache
        .find_material(
            "textures/test/image",
            MaterialLightmapId::STRETCH_PIC,
            true,
            &mut fixture.ctx(),
        )
        .unwrap();
    let material = cache.material(index);
    assert_eq!(material.num_unfogged_passes, 1);
    assert_eq!(material.stages[0].rgb_gen, ColorGen::Vertex);
    assert_eq!(material.stages[0].alpha_gen, AlphaGen::Vertex);
    assert_eq!(material.stages[0].blend, Some((BF::SrcAlpha, BF::OneMinusSrcAlpha)));
}

#[test]
fn synthesis_for_vertex_lightmap() {
    let mut fixture = Fixture::new("");
    let mut cache = fixture.cache();
    let index = cache
        .find_material(
            "textures/test/image",
            MaterialLightmapId::VERTEX,
            true,
            &mut fixture.ctx(),
        )
        .unwrap();
    let material = cache.material(index);
    assert_eq!(material.stages[0].rgb_gen, ColorGen::ExactVertex);
    assert_eq!(material.stages[0].alpha_gen, AlphaGen::Skip);
}

#[test]
fn synthesis_without_lightmap_is_lighting_diffuse() {
    let mut fixture = Fixture::new("");
    let mut cache = fixture.cache();
    let index = cache
        .find_material("textures/test/image", MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .unwrap();
    assert_eq!(cache.material(index).stages[0].rgb_gen, ColorGen::LightingDiffuse);
}

// ============================================================================
// Parsing
// ============================================================================

#[test]
fn parses_stages_and_directives() {
    let text = r"
textures/test/flame
{
    cull none
    deformVertexes wave 100 sin 0 1 0 1
    {
        map textures/test/image.png
        blendfunc add
        rgbGen wave sin 0.5 0.5 0 0.5
    }
    {
        map $whiteimage
        blendfunc filter
    }
}
";
    let mut fixture = Fixture::new(text);
    let mut cache = fixture.cache();
    let index = cache
        .find_material("textures/test/flame", MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .unwrap();
    let material = cache.material(index);

    assert!(material.explicitly_defined);
    assert_eq!(material.cull_type, strafe::material::CullType::TwoSided);
    assert_eq!(material.n_deforms, 1);
    assert!((material.deforms[0].spread - 0.01).abs() < 1e-6);
    assert_eq!(material.num_unfogged_passes, 2);

    // Exactly the first k stages are active.
    for (i, stage) in material.stages.iter().enumerate() {
        assert_eq!(stage.active, i < material.num_unfogged_passes);
    }
}

#[test]
fn one_zero_blend_disables_blending() {
    let text = r"
textures/test/solid
{
    {
        map $whiteimage
        blendfunc GL_ONE GL_ZERO
    }
}
";
    let mut fixture = Fixture::new(text);
    let mut cache = fixture.cache();
    let index = cache
        .find_material("textures/test/solid", MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .unwrap();
    let stage = &cache.material(index).stages[0];
    assert_eq!(stage.blend, None);
    assert!(stage.depth_write);
}

#[test]
fn implicit_alpha_gen_skip() {
    let text = r"
textures/test/plain
{
    {
        map $whiteimage
        rgbGen identity
    }
}
";
    let mut fixture = Fixture::new(text);
    let mut cache = fixture.cache();
    let index = cache
        .find_material("textures/test/plain", MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .unwrap();
    assert_eq!(cache.material(index).stages[0].alpha_gen, AlphaGen::Skip);
}

#[test]
fn sort_derivation_for_blended_stages() {
    let text = r"
textures/test/glass
{
    {
        map $whiteimage
        blendfunc blend
    }
}
textures/test/grate
{
    {
        map $whiteimage
        blendfunc blend
        depthwrite
    }
}
textures/test/teleporter
{
    portal
    {
        map $whiteimage
    }
}
";
    let mut fixture = Fixture::new(text);
    let mut cache = fixture.cache();
    let mut ctx = fixture.ctx();

    let glass = cache
        .find_material("textures/test/glass", MaterialLightmapId::NONE, true, &mut ctx)
        .unwrap();
    let grate = cache
        .find_material("textures/test/grate", MaterialLightmapId::NONE, true, &mut ctx)
        .unwrap();
    let teleporter = cache
        .find_material("textures/test/teleporter", MaterialLightmapId::NONE, true, &mut ctx)
        .unwrap();

    assert_eq!(cache.material(glass).sort, sort::BLEND0);
    assert_eq!(cache.material(grate).sort, sort::SEE_THROUGH);
    assert_eq!(cache.material(teleporter).sort, sort::PORTAL);
    assert!(cache.material(teleporter).is_portal);
}

#[test]
fn lightmap_stage_collapses_into_diffuse() {
    let text = r"
textures/test/wall
{
    {
        map $lightmap
        rgbGen identity
    }
    {
        map textures/test/image.png
        blendfunc GL_DST_COLOR GL_ZERO
        rgbGen identity
    }
}
";
    let mut fixture = Fixture::new(text);
    let mut cache = fixture.cache();
    let index = cache
        .find_material("textures/test/wall", MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .unwrap();
    let material = cache.material(index);

    // The diffuse stage absorbed the lightmap into bundle 1 and the
    // lightmap-only stage was deactivated.
    assert_eq!(material.num_unfogged_passes, 1);
    assert_eq!(material.stages[0].light, strafe::material::MaterialLight::Map);
    assert!(material.stages[0].bundles[1].is_lightmap);
    assert_eq!(material.stages[0].bundles[0].tc_gen, TexCoordGen::Texture);
}

#[test]
fn unknown_directive_falls_back_to_default() {
    let text = r"
textures/test/broken
{
    notADirective 1 2 3
}
";
    let mut fixture = Fixture::new(text);
    let mut cache = fixture.cache();
    let index = cache
        .find_material("textures/test/broken", MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .unwrap();
    assert!(cache.material(index).default_shader);
}

#[test]
fn malformed_file_discards_remainder_only() {
    // The second shader is missing its opening brace: it and everything
    // after it is dropped, the first shader survives.
    let text = r"
textures/test/good
{
    {
        map $whiteimage
    }
}
textures/test/bad
    cull none
textures/test/after
{
    {
        map $whiteimage
    }
}
";
    let mut fixture = Fixture::new(text);
    let mut cache = fixture.cache();
    let mut ctx = fixture.ctx();

    let good = cache
        .find_material("textures/test/good", MaterialLightmapId::NONE, true, &mut ctx)
        .unwrap();
    assert!(cache.material(good).explicitly_defined);

    let after = cache
        .find_material("textures/test/after", MaterialLightmapId::NONE, true, &mut ctx)
        .unwrap();
    assert!(!cache.material(after).explicitly_defined);
}

#[test]
fn fog_only_material_gets_fog_sort() {
    let text = r"
textures/test/fog
{
    surfaceParm fog
    fogParms ( 0.5 0.4 0.3 ) 1024
}
";
    let mut fixture = Fixture::new(text);
    let mut cache = fixture.cache();
    let index = cache
        .find_material("textures/test/fog", MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .unwrap();
    let material = cache.material(index);
    assert_eq!(material.sort, sort::FOG);
    assert_eq!(material.fog_pass, strafe::material::FogPass::LessOrEqual);
    assert!((material.fog_parms.depth_for_opaque - 1024.0).abs() < 1e-3);
}

#[test]
fn autosprite_deform_is_detected() {
    let text = r"
textures/test/sprite
{
    deformVertexes autosprite
    {
        map $whiteimage
    }
}
";
    let mut fixture = Fixture::new(text);
    let mut cache = fixture.cache();
    let index = cache
        .find_material("textures/test/sprite", MaterialLightmapId::NONE, true, &mut fixture.ctx())
        .unwrap();
    assert!(cache.material(index).has_auto_sprite_deform());
}

// ============================================================================
// Remapping
// ============================================================================

#[test]
fn remap_redirects_and_self_remap_clears() {
    let text = r"
textures/test/a
{
    {
        map $whiteimage
    }
}
textures/test/b
{
    {
        map $whiteimage
    }
}
";
    let mut fixture = Fixture::new(text);
    let mut cache = fixture.cache();
    let mut ctx = fixture.ctx();

    let a = cache
        .find_material("textures/test/a", MaterialLightmapId::STRETCH_PIC, true, &mut ctx)
        .unwrap();
    let b = cache
        .find_material("textures/test/b", MaterialLightmapId::STRETCH_PIC, true, &mut ctx)
        .unwrap();

    cache.remap_material("textures/test/a", "textures/test/b", Some("1.5"), &mut ctx);
    assert_eq!(cache.resolve(a), b);
    assert!((cache.material(b).time_offset - 1.5).abs() < 1e-6);

    // A remapped material must never point at itself.
    cache.remap_material("textures/test/a", "textures/test/a", None, &mut ctx);
    assert_eq!(cache.resolve(a), a);
}

// ============================================================================
// Skins
// ============================================================================

#[test]
fn skin_parsing() {
    let mut fixture = Fixture::new("");
    fixture.host.add_file(
        "models/players/visor/lower_default.skin",
        b"tag_head,\nl_legs,textures/test/image\nmd3_lower,models/x/lower.md3\nplayerscale 1.2\n"
            .to_vec(),
    );

    let mut cache = fixture.cache();
    let mut ctx = fixture.ctx();
    let handle = cache
        .find_skin("models/players/visor/lower_default.skin", &mut ctx)
        .unwrap();
    assert!(handle >= 1);

    let skin = cache.skin(handle).unwrap();
    assert!(skin.find_material("l_legs").is_some());
    assert!(skin.find_material("tag_head").is_none());
    assert_eq!(skin.find_model_name("md3_lower"), Some("models/x/lower.md3"));
    assert!((skin.scale - 1.2).abs() < 1e-6);
}

#[test]
fn missing_skin_is_none() {
    let mut fixture = Fixture::new("");
    let mut cache = fixture.cache();
    let mut ctx = fixture.ctx();
    assert!(cache.find_skin("models/players/none.skin", &mut ctx).is_none());
}
