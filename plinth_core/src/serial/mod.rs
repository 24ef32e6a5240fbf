//! Readable-data and binary serialization driven by struct descriptions.

pub mod binary;
pub mod rd;

pub use binary::{read_binary, write_binary, BinaryError, BinaryReader, ReadState};
pub use rd::{read_rd, read_rd_type_header, write_rd, RdError};

#[cfg(test)]
mod tests {
    use crate::interner::{intern, InternedString};
    use crate::reflection::dynarray::DynArray;
    use crate::reflection::{
        EnumDescription, FieldArchetype, Reflected, Registry, RegistryBuilder,
        StructDescriptionBuilder,
    };
    use std::sync::Arc;

    #[derive(Default)]
    #[repr(C)]
    struct Orbit {
        radius: f32,
        period: f64,
    }

    impl Reflected for Orbit {
        fn type_name() -> InternedString {
            intern("orbit")
        }

        fn describe() -> crate::reflection::StructDescription {
            StructDescriptionBuilder::for_type::<Orbit>("orbit")
                .field("radius", std::mem::offset_of!(Orbit, radius), FieldArchetype::F32)
                .field("period", std::mem::offset_of!(Orbit, period), FieldArchetype::F64)
                .build()
        }
    }

    #[derive(Default)]
    #[repr(C)]
    struct Body {
        name: InternedString,
        mass: u64,
        charge: i32,
        habitable: bool,
        kind: u32,
        orbit: Orbit,
        moons: DynArray,
    }

    impl Reflected for Body {
        fn type_name() -> InternedString {
            intern("body")
        }

        fn describe() -> crate::reflection::StructDescription {
            StructDescriptionBuilder::for_type::<Body>("body")
                .field(
                    "name",
                    std::mem::offset_of!(Body, name),
                    FieldArchetype::InternedString,
                )
                .field("mass", std::mem::offset_of!(Body, mass), FieldArchetype::U64)
                .field("charge", std::mem::offset_of!(Body, charge), FieldArchetype::I32)
                .field(
                    "habitable",
                    std::mem::offset_of!(Body, habitable),
                    FieldArchetype::Bool,
                )
                .field(
                    "kind",
                    std::mem::offset_of!(Body, kind),
                    FieldArchetype::Enum {
                        type_name: intern("body_kind"),
                    },
                )
                .sized_field(
                    "orbit",
                    std::mem::offset_of!(Body, orbit),
                    std::mem::size_of::<Orbit>(),
                    FieldArchetype::Struct {
                        type_name: intern("orbit"),
                    },
                )
                .field(
                    "moons",
                    std::mem::offset_of!(Body, moons),
                    FieldArchetype::Array {
                        element: Box::new(FieldArchetype::InternedString),
                        element_size: std::mem::size_of::<InternedString>() as u32,
                        element_align: std::mem::align_of::<InternedString>() as u32,
                    },
                )
                .build()
        }
    }

    fn registry() -> Arc<Registry> {
        let mut builder = RegistryBuilder::new();
        builder.add_type::<Orbit>();
        builder.add_type::<Body>();
        builder.add_enum(EnumDescription {
            name: intern("body_kind"),
            variants: vec![intern("rocky"), intern("gaseous"), intern("icy")],
        });
        builder.build()
    }

    fn sample() -> Body {
        let mut body = Body {
            name: intern("kepler"),
            mass: 597_220,
            charge: -3,
            habitable: true,
            kind: 1,
            orbit: Orbit {
                radius: 1.5,
                period: 364.25,
            },
            moons: DynArray::of::<InternedString>(),
        };
        body.moons.push_copy(intern("luna"));
        body.moons.push_copy(intern("phobos"));
        body
    }

    fn assert_is_sample(registry: &Registry, record: &crate::repository::record::RecordBox) {
        let original = sample();
        let description = registry.find_struct(intern("body")).unwrap();
        unsafe {
            assert!(registry.instances_equal(
                description,
                (&original as *const Body).cast(),
                record.data(),
            ));
        }
    }

    #[test]
    fn rd_round_trip() {
        let registry = registry();
        let body = sample();
        let description = registry.find_struct(intern("body")).unwrap().clone();

        let text = unsafe {
            super::write_rd(&registry, &description, (&body as *const Body).cast()).unwrap()
        };
        assert!(text.starts_with("//! type = body"));
        assert!(text.contains("kind = gaseous"));
        assert!(text.contains("+moons = \"luna\""));

        let record = super::read_rd(&text, &registry, Some(intern("body"))).unwrap();
        assert_is_sample(&registry, &record);
    }

    #[test]
    fn rd_type_mismatch_is_rejected() {
        let registry = registry();
        let result = super::read_rd("//! type = body\n", &registry, Some(intern("orbit")));
        assert!(matches!(result, Err(super::RdError::TypeMismatch { .. })));
    }

    #[test]
    fn rd_parses_partial_documents_over_defaults() {
        let registry = registry();
        let text = "//! type = body\nmass = 10\norbit {\n    radius = 2.5\n}\n";
        let record = super::read_rd(text, &registry, None).unwrap();
        let body: &Body = unsafe { record.typed() };
        assert_eq!(body.mass, 10);
        assert!(!body.habitable);
        assert!((body.orbit.radius - 2.5).abs() < f32::EPSILON);
        assert_eq!(body.moons.len(), 0);
    }

    #[test]
    fn binary_round_trip() {
        let registry = registry();
        let body = sample();
        let description = registry.find_struct(intern("body")).unwrap().clone();

        let mut bytes = Vec::new();
        unsafe {
            super::write_binary(&mut bytes, &registry, &description, (&body as *const Body).cast())
                .unwrap();
        }

        let record =
            super::read_binary(bytes.as_slice(), &registry, Some(intern("body"))).unwrap();
        assert_is_sample(&registry, &record);
    }

    #[test]
    fn binary_reader_is_streamable() {
        let registry = registry();
        let body = sample();
        let description = registry.find_struct(intern("body")).unwrap().clone();

        let mut bytes = Vec::new();
        unsafe {
            super::write_binary(&mut bytes, &registry, &description, (&body as *const Body).cast())
                .unwrap();
        }

        let mut reader =
            super::BinaryReader::new(bytes.as_slice(), &registry, Some(intern("body"))).unwrap();
        let mut chunks = 0;
        while let super::ReadState::InProgress = reader.read_chunk().unwrap() {
            chunks += 1;
        }
        assert_eq!(chunks, description.fields.len());
    }

    #[test]
    fn binary_type_identity_is_checked() {
        let registry = registry();
        let orbit = Orbit::default();
        let description = registry.find_struct(intern("orbit")).unwrap().clone();

        let mut bytes = Vec::new();
        unsafe {
            super::write_binary(&mut bytes, &registry, &description, (&orbit as *const Orbit).cast())
                .unwrap();
        }

        let result = super::read_binary(bytes.as_slice(), &registry, Some(intern("body")));
        assert!(matches!(result, Err(super::BinaryError::TypeMismatch { .. })));
    }
}
