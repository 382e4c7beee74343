#![deny(unsafe_code)]

//! In-process transport for tether.
//!
//! [`pipe`] connects two [`MemTransport`] ends with bounded channels. This is
//! the semantic reference transport: protocol tests drive one end with raw
//! messages while a real connection runs on the other.

use std::io;

use tokio::sync::mpsc;

use tether_rpc::MessageTransport;
use tether_wire::Message;

/// One end of an in-process message pipe.
pub struct MemTransport {
    tx: Option<mpsc::Sender<Message>>,
    rx: mpsc::Receiver<Message>,
}

/// Create a connected transport pair. `capacity` bounds each direction.
pub fn pipe(capacity: usize) -> (MemTransport, MemTransport) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        MemTransport {
            tx: Some(a_tx),
            rx: a_rx,
        },
        MemTransport {
            tx: Some(b_tx),
            rx: b_rx,
        },
    )
}

impl MessageTransport for MemTransport {
    async fn send(&mut self, msg: Message) -> io::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(msg)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport closed",
            )),
        }
    }

    async fn recv(&mut self) -> io::Result<Option<Message>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_wire::QuestionId;

    #[tokio::test]
    async fn messages_cross_the_pipe_in_order() {
        let (mut a, mut b) = pipe(4);
        for i in 0..3 {
            a.send(Message::Bootstrap {
                question_id: QuestionId::new(i),
            })
            .await
            .unwrap();
        }
        for i in 0..3 {
            match b.recv().await.unwrap() {
                Some(Message::Bootstrap { question_id }) => {
                    assert_eq!(question_id.raw(), i);
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let (a, mut b) = pipe(1);
        drop(a);
        assert!(b.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (mut a, _b) = pipe(1);
        a.close().await;
        let err = a
            .send(Message::Bootstrap {
                question_id: QuestionId::new(0),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
