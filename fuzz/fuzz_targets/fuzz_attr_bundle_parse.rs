#![no_main]

use std::sync::OnceLock;

use arbitrary::Unstructured;
use libfuzzer_sys::fuzz_target;

use uverbs_ioctl::{
    driver_id, errno, handler, AccessMode, AttrBundle, AttrSpec, DispatchOptions, HandleTable,
    HandlerError, IoctlHeader, MethodDef, ObjectClass, ObjectDef, ObjectRegistry, ObjectTreeDef,
    ObjectType, SpecTree, UverbsSession, WireAttr,
};
use uverbs_memory::{MappedUserMemory, UserMemory};

/// Where the request header is mapped.
const REQ: u64 = 0x1000;
/// Largest request the harness maps; anything past it faults.
const MAX_ATTRS: usize = 32;
const MAX_REQUEST_BYTES: usize = IoctlHeader::SIZE_BYTES + MAX_ATTRS * WireAttr::SIZE_BYTES;
/// A separate mapping that out-of-line payloads can point into.
const PAYLOAD: u64 = 0x8000;
const PAYLOAD_SIZE: usize = 0x400;

const OBJ_DEVICE: u16 = 0;
const OBJ_PD: u16 = 1;
const OBJ_CQ: u16 = 2;

struct Session {
    mem: MappedUserMemory,
    objects: HandleTable,
    context: bool,
}

impl UverbsSession for Session {
    fn user_memory(&mut self) -> &mut dyn UserMemory {
        &mut self.mem
    }

    fn objects(&mut self) -> &mut dyn ObjectRegistry {
        &mut self.objects
    }

    fn has_context(&self) -> bool {
        self.context
    }
}

static CQ_FORMATS: [AttrSpec; 3] = [
    AttrSpec::ptr_in(4),
    AttrSpec::ptr_in_sz(8, 16).min_sz_or_zero(),
    AttrSpec::ptr_in(32),
];

/// Touches every attribute id in `ids` through every accessor.
fn consume(session: &mut Session, bundle: &AttrBundle, ids: &[u16]) {
    let mut buf = [0u8; 48];
    for &id in ids {
        let len = bundle.ptr_len(id).unwrap_or(0).min(buf.len());
        let _ = bundle.copy_in(session.user_memory(), id, &mut buf[..len]);
        let _ = bundle.copy_in(session.user_memory(), id, &mut buf);
        let _ = bundle.copy_out(session.user_memory(), id, &[0xa5; 48]);
        let _ = bundle.get_enum_selection(id);
        let _ = bundle.get_resource(id);
    }
}

fn tree() -> &'static SpecTree<(), Session> {
    static TREE: OnceLock<SpecTree<(), Session>> = OnceLock::new();
    TREE.get_or_init(|| {
        let common = ObjectTreeDef::new()
            .object(
                ObjectDef::new(OBJ_DEVICE).method(
                    MethodDef::new(0)
                        .create_root()
                        .attr(0, AttrSpec::ptr_out(8))
                        .attr(1, AttrSpec::ptr_in_sz(4, 12).min_sz_or_zero())
                        .handler(handler(|_: &(), s: &mut Session, b: &AttrBundle| {
                            consume(s, b, &[0, 1]);
                            s.context = true;
                            Ok(())
                        })),
                ),
            )
            .object(
                ObjectDef::new(OBJ_PD)
                    .type_attrs(ObjectType::idr("pd"))
                    .method(
                        MethodDef::new(0)
                            .attr(0, AttrSpec::idr(OBJ_PD, AccessMode::Create).mandatory())
                            .handler(handler(|_: &(), s: &mut Session, b: &AttrBundle| {
                                consume(s, b, &[0]);
                                Ok(())
                            })),
                    )
                    .method(
                        MethodDef::new(1)
                            .attr(0, AttrSpec::idr(OBJ_PD, AccessMode::Destroy).mandatory())
                            .handler(handler(|_: &(), _: &mut Session, _: &AttrBundle| Ok(()))),
                    ),
            )
            .object(
                ObjectDef::new(OBJ_CQ)
                    .type_attrs(ObjectType::fd("cq"))
                    .method(
                        MethodDef::new(0)
                            .attr(0, AttrSpec::fd(OBJ_CQ, AccessMode::Create).mandatory())
                            .attr(1, AttrSpec::idr(OBJ_PD, AccessMode::Read))
                            .attr(2, AttrSpec::enum_in(&CQ_FORMATS))
                            .attr(3, AttrSpec::ptr_out_sz(4, 16))
                            .handler(handler(|_: &(), s: &mut Session, b: &AttrBundle| {
                                consume(s, b, &[0, 1, 2, 3]);
                                Ok(())
                            })),
                    ),
            );
        let driver = ObjectTreeDef::new().object(
            ObjectDef::new(OBJ_CQ).method(
                MethodDef::new(0)
                    .attr(driver_id(0), AttrSpec::ptr_in(8))
                    .handler(handler(|_: &(), s: &mut Session, b: &AttrBundle| {
                        consume(s, b, &[0, 1, 2, 3, driver_id(0), driver_id(1)]);
                        Err(HandlerError::Errno(errno::EINVAL))
                    })),
            ),
        );
        SpecTree::merge(&[&common, &driver]).expect("fuzz spec tree must merge")
    })
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);

    let context: bool = u.arbitrary().unwrap_or(true);
    let request_len = u.int_in_range(0usize..=MAX_REQUEST_BYTES).unwrap_or(0);
    let request = u.bytes(request_len).unwrap_or(&[]);
    let payload_len = u.len().min(PAYLOAD_SIZE);
    let payload = u.bytes(payload_len).unwrap_or(&[]);

    let mut mem = MappedUserMemory::new();
    if mem.map(REQ, MAX_REQUEST_BYTES).is_err() || mem.map(PAYLOAD, PAYLOAD_SIZE).is_err() {
        return;
    }
    let _ = mem.write_from(REQ, request);
    let _ = mem.write_from(PAYLOAD, payload);

    let mut objects = HandleTable::new();
    let _ = objects.insert(ObjectClass::Idr, OBJ_PD);
    let _ = objects.insert(ObjectClass::Fd, OBJ_CQ);
    let live_before = objects.len();

    let mut session = Session {
        mem,
        objects,
        context,
    };
    let result = tree().dispatch(&(), &mut session, REQ, &DispatchOptions::default());
    if let Err(err) = &result {
        assert!(err.to_errno() < 0);
    }

    // A failed request leaves no objects behind and removes none.
    if result.is_err() {
        assert_eq!(session.objects.len(), live_before);
    }
});
