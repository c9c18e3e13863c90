//! Property checks over random interleavings of writes and reads on one
//! channel.

use std::collections::VecDeque;
use std::sync::Arc;

use mailbox_io::{Fd, Mailbox, MailboxConfig, RegionMemory, Side};
use proptest::collection;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Write(Vec<u8>),
    Read(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        collection::vec(any::<u8>(), 0..40).prop_map(Op::Write),
        (0usize..40).prop_map(Op::Read),
    ]
}

proptest! {
    /// Bytes come out in the order they went in, transfers are never longer
    /// than the space or data present, and neither side ever sees more than
    /// `C - 1` bytes.
    #[test]
    fn ring_behaves_as_bounded_fifo(
        capacity in (1usize..12).prop_map(|words| words * 4),
        ops in collection::vec(op(), 1..120),
    ) {
        let config = MailboxConfig::compact(capacity);
        let memory = Arc::new(RegionMemory::new(config.window_len).unwrap());
        let host = Mailbox::new(Arc::clone(&memory), Side::Host, config.clone()).unwrap();
        let coproc = Mailbox::new(memory, Side::CoProcessor, config).unwrap();
        let mut model = VecDeque::new();

        for op in ops {
            let space = host.available(Fd::RPC_IN).unwrap();
            let pending = coproc.available(Fd::RPC_IN).unwrap();
            prop_assert!(space <= capacity - 1);
            prop_assert!(pending <= capacity - 1);
            prop_assert_eq!(space + pending, capacity - 1);
            prop_assert_eq!(pending, model.len());
            prop_assert_eq!(coproc.available(Fd::RPC_IN).unwrap(), pending);

            match op {
                Op::Write(bytes) => {
                    let n = host.try_write(Fd::RPC_IN, &bytes).unwrap();
                    prop_assert_eq!(n, bytes.len().min(space));
                    model.extend(&bytes[..n]);
                }
                Op::Read(len) => {
                    let mut buf = vec![0u8; len];
                    let n = coproc.try_read(Fd::RPC_IN, &mut buf).unwrap();
                    prop_assert_eq!(n, len.min(pending));
                    let expected: Vec<u8> = model.drain(..n).collect();
                    prop_assert_eq!(&buf[..n], &expected[..]);
                }
            }
        }
    }

    /// Any split of a message into writes, drained in between, reassembles it.
    #[test]
    fn chunked_writes_concatenate(
        message in collection::vec(any::<u8>(), 1..300),
        chunk in 1usize..20,
    ) {
        let (host, coproc) = {
            let config = MailboxConfig::compact(16);
            let memory = Arc::new(RegionMemory::new(config.window_len).unwrap());
            (
                Mailbox::new(Arc::clone(&memory), Side::Host, config.clone()).unwrap(),
                Mailbox::new(memory, Side::CoProcessor, config).unwrap(),
            )
        };
        let mut received = Vec::new();
        for piece in message.chunks(chunk) {
            let mut sent = 0;
            while sent < piece.len() {
                sent += host.write(Fd::CONSOLE_IN, &piece[sent..]).unwrap();
                let mut buf = [0u8; 16];
                let n = coproc.try_read(Fd::CONSOLE_IN, &mut buf).unwrap();
                received.extend_from_slice(&buf[..n]);
            }
        }
        prop_assert_eq!(received, message);
    }
}
