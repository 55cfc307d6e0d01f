#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;

use uverbs_memory::{MappedUserMemory, UserMemory};

/// Keep mappings small so each iteration stays cheap.
const MAX_MAP_LEN: usize = 0x2000;
const MAX_IO_LEN: usize = 0x400;
const MAX_OPS: usize = 64;

#[derive(Debug, Arbitrary)]
enum Op {
    Map { addr: u64, len: u16 },
    Unmap { addr: u64 },
    Read { addr: u64, len: u16 },
    Write { addr: u64, bytes: Vec<u8> },
    Zeroed { addr: u64, len: u16 },
}

/// Mostly land near a few fixed bases so mappings touch and overlap; sometimes go anywhere.
fn steer(addr: u64) -> u64 {
    match addr % 4 {
        0 => 0x1000 + (addr >> 2) % 0x4000,
        1 => u64::MAX - (addr >> 2) % 0x4000,
        _ => addr,
    }
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    let mut mem = MappedUserMemory::new();

    for _ in 0..MAX_OPS {
        let Ok(op) = Op::arbitrary(&mut u) else {
            break;
        };
        match op {
            Op::Map { addr, len } => {
                let _ = mem.map(steer(addr), usize::from(len).min(MAX_MAP_LEN));
            }
            Op::Unmap { addr } => {
                mem.unmap(steer(addr));
            }
            Op::Read { addr, len } => {
                let addr = steer(addr);
                let mut buf = vec![0u8; usize::from(len).min(MAX_IO_LEN)];
                let ok = mem.read_into(addr, &mut buf).is_ok();
                assert_eq!(ok, mem.is_mapped(addr, buf.len()));
            }
            Op::Write { addr, bytes } => {
                let addr = steer(addr);
                let bytes = &bytes[..bytes.len().min(MAX_IO_LEN)];
                if mem.write_from(addr, bytes).is_ok() {
                    let mut back = vec![0u8; bytes.len()];
                    mem.read_into(addr, &mut back).expect("just written");
                    assert_eq!(&back[..], bytes);
                }
            }
            Op::Zeroed { addr, len } => {
                let _ = mem.is_zeroed(steer(addr), usize::from(len));
            }
        }
    }
});
