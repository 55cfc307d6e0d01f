#![cfg(not(target_arch = "wasm32"))]

use proptest::prelude::*;
use uverbs_ioctl::{
    AccessMode, AttrSpec, HandleTable, MethodDef, ObjectClass, ObjectDef, ObjectTreeDef,
    ObjectType, ParseError, ParseOptions, SpecTree, UserAttrs, WireAttr, ID_DRIVER_NS,
};
use uverbs_memory::{DenseUserMemory, UserMemory};

const OBJ: u16 = 1;
const METH: u16 = 0;
const MR: u16 = 2;
const BASE: u64 = 0x8000;
const SIZE: u64 = 0x200;

static SEL: [AttrSpec; 3] = [
    AttrSpec::ptr_in(4),
    AttrSpec::ptr_in_sz(8, 24).min_sz_or_zero(),
    AttrSpec::ptr_in(16),
];

fn tree() -> SpecTree<(), ()> {
    let defs = ObjectTreeDef::new()
        .object(
            ObjectDef::new(OBJ).method(
                MethodDef::new(METH)
                    .attr(0, AttrSpec::ptr_in(8))
                    .attr(1, AttrSpec::ptr_in_sz(4, 16).min_sz_or_zero())
                    .attr(2, AttrSpec::ptr_out_sz(4, 32))
                    .attr(3, AttrSpec::enum_in(&SEL))
                    .attr(4, AttrSpec::idr(MR, AccessMode::Read))
                    .attr(5, AttrSpec::idr(MR, AccessMode::Write))
                    .attr(6, AttrSpec::idr(MR, AccessMode::Create))
                    .attr(ID_DRIVER_NS + 2, AttrSpec::ptr_in(2).mandatory()),
            ),
        )
        .object(
            ObjectDef::new(MR)
                .type_attrs(ObjectType::idr("mr"))
                .method(MethodDef::new(0)),
        );
    SpecTree::merge(&[&defs]).unwrap()
}

fn wire_attr() -> impl Strategy<Value = WireAttr> {
    (
        prop_oneof![0u16..8, Just(ID_DRIVER_NS + 2), any::<u16>()],
        prop_oneof![0u16..40, any::<u16>()],
        any::<u16>(),
        prop_oneof![Just(0u8), 0u8..4, any::<u8>()],
        prop_oneof![Just(0u8), any::<u8>()],
        prop_oneof![BASE..BASE + SIZE, 0u64..4, any::<u64>()],
    )
        .prop_map(|(attr_id, len, flags, elem_id, reserved, data)| WireAttr {
            attr_id,
            len,
            flags,
            elem_id,
            reserved,
            data,
        })
}

proptest! {
    #[test]
    fn parse_and_access_never_panic(
        records in proptest::collection::vec(wire_attr(), 0..12),
        fill in proptest::collection::vec(any::<u8>(), SIZE as usize),
        dst_len in 0usize..40,
    ) {
        let tree = tree();
        let mut mem = DenseUserMemory::new(BASE, SIZE).unwrap();
        mem.write_from(BASE, &fill).unwrap();

        let mut objects = HandleTable::new();
        let existing = objects.insert(ObjectClass::Idr, MR).unwrap();

        let attrs = UserAttrs::from_records(records, BASE);
        match tree.parse(OBJ, METH, &attrs, Some(&mut objects), &ParseOptions::default()) {
            Ok(bundle) => {
                let mut dst = vec![0u8; dst_len];
                for id in [0u16, 1, 2, 3, 4, 5, 6, 7, ID_DRIVER_NS + 2, 0x3004] {
                    let _ = bundle.copy_in(&mem, id, &mut dst);
                    let _ = bundle.copy_out(&mut mem, id, &dst);
                    let _ = bundle.get_enum_selection(id);
                    let _ = bundle.get_resource(id);
                    let _ = bundle.ptr_len(id);
                }
                prop_assert!(bundle.is_present(ID_DRIVER_NS + 2));
                bundle.abort();
            }
            Err(err) => {
                prop_assert!(err.to_errno() < 0);
            }
        }

        // Every outcome leaves the registry as it found it.
        prop_assert_eq!(objects.len(), 1);
        prop_assert_eq!(objects.use_count(ObjectClass::Idr, existing.id), Some(0));
    }

    #[test]
    fn missing_mandatory_names_the_driver_attribute(
        optional in proptest::collection::btree_set(0u16..2, 0..=2),
    ) {
        let tree = tree();
        let records: Vec<WireAttr> = optional
            .iter()
            .map(|&id| match id {
                0 => WireAttr::inline(0, &[0; 8]),
                _ => WireAttr::inline(1, &[0; 4]),
            })
            .collect();
        let attrs = UserAttrs::from_records(records, BASE);
        prop_assert_eq!(
            tree.parse(OBJ, METH, &attrs, None, &ParseOptions::default()).unwrap_err(),
            ParseError::MissingMandatory { id: ID_DRIVER_NS + 2 }
        );
    }
}
