use std::io::{BufRead, BufReader, ErrorKind};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::EventSource;
use crate::error::SourceError;
use crate::processing::events::Event;

/// Live bridge to the acquisition system: one JSON event per line over TCP.
///
/// Reads block for at most `poll_interval`; an idle stream reads as "no
/// event yet" rather than an error. Lines that do not decode to an event are
/// logged and skipped.
pub struct NetworkEventSource {
    reader: BufReader<TcpStream>,
    /// Bytes of a line not yet terminated by `\n`.
    line: Vec<u8>,
    poll_interval: Duration,
    closed: bool,
}

impl NetworkEventSource {
    pub fn connect(addr: &str, poll_interval: Duration) -> Result<Self, SourceError> {
        let connect_err = |source| SourceError::Connect {
            addr: addr.to_string(),
            source,
        };
        let stream = TcpStream::connect(addr).map_err(connect_err)?;
        stream
            .set_read_timeout(Some(poll_interval))
            .map_err(connect_err)?;
        stream.set_nodelay(true).map_err(connect_err)?;
        info!("connected to event stream at {}", addr);

        Ok(Self {
            reader: BufReader::new(stream),
            line: Vec::new(),
            poll_interval,
            closed: false,
        })
    }

    fn read_event(&mut self) -> Result<Option<Event>, SourceError> {
        loop {
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => {
                    self.closed = true;
                    return Err(SourceError::Closed);
                }
                Ok(_) if !self.line.ends_with(b"\n") => continue,
                Ok(_) => {
                    let line = std::mem::take(&mut self.line);
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match serde_json::from_slice(&line) {
                        Ok(event) => return Ok(Some(event)),
                        Err(e) => warn!(
                            "skipping undecodable event {:?}: {}",
                            String::from_utf8_lossy(&line).trim_end(),
                            e
                        ),
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl EventSource for NetworkEventSource {
    fn next_event(&mut self) -> Result<Option<Event>, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        self.read_event()
    }

    fn clear(&mut self) -> Result<Vec<Event>, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        let mut drained = Vec::new();
        while let Some(event) = self.read_event()? {
            drained.push(event);
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "flushed network buffer");
        }
        Ok(drained)
    }

    fn close(&mut self) -> Result<(), SourceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.reader.get_ref().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn name(&self) -> &str {
        "network"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    fn serve(chunks: Vec<&'static str>) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for chunk in chunks {
                stream.write_all(chunk.as_bytes()).unwrap();
                stream.flush().unwrap();
                thread::sleep(Duration::from_millis(30));
            }
        });
        (addr, handle)
    }

    fn poll(source: &mut NetworkEventSource) -> Result<Event, SourceError> {
        for _ in 0..200 {
            if let Some(event) = source.next_event()? {
                return Ok(event);
            }
        }
        panic!("no event within the polling budget");
    }

    #[test]
    fn reads_line_delimited_events_split_across_packets() {
        let (addr, server) = serve(vec![
            "{\"type\":\"trigger\",\"label\":2,\"timestamp\":1.5}\n\n{\"type\":\"spi",
            "ke\",\"channel\":5,\"unit\":1,\"timestamp\":1.52}\n",
        ]);
        let mut source = NetworkEventSource::connect(&addr, Duration::from_millis(5)).unwrap();

        assert_eq!(
            poll(&mut source).unwrap(),
            Event::Trigger {
                label: 2,
                timestamp: 1.5
            }
        );
        assert_eq!(
            poll(&mut source).unwrap(),
            Event::Spike {
                channel: 5,
                unit: 1,
                timestamp: 1.52
            }
        );
        server.join().unwrap();
        assert!(matches!(poll(&mut source), Err(SourceError::Closed)));
    }

    #[test]
    fn undecodable_lines_are_skipped() {
        let (addr, server) = serve(vec![
            "not json\n{\"type\":\"warp\",\"timestamp\":1.0}\n",
            "{\"type\":\"other\",\"timestamp\":1.1}\n{\"type\":\"trigger\",\"label\":3,\"timestamp\":1.2}\n",
        ]);
        let mut source = NetworkEventSource::connect(&addr, Duration::from_millis(5)).unwrap();
        assert_eq!(
            poll(&mut source).unwrap(),
            Event::Trigger {
                label: 3,
                timestamp: 1.2
            }
        );
        server.join().unwrap();
        assert!(matches!(poll(&mut source), Err(SourceError::Closed)));
    }

    #[test]
    fn unreachable_address_fails_to_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(matches!(
            NetworkEventSource::connect(&addr, Duration::from_millis(5)),
            Err(SourceError::Connect { .. })
        ));
    }
}
