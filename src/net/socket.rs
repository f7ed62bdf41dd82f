//! Datagram-socket host stack adapter.
//!
//! Bridges to an out-of-process network stack over a Unix datagram
//! socket, one datagram per Ethernet frame. Outbound datagrams are read
//! on a dedicated thread so a full transmit queue blocks that thread,
//! not the async runtime; inbound replies go out through a separate
//! non-blocking socket so the bridge actor never waits on the host.

use std::{
   fs, io,
   os::unix::net::UnixDatagram,
   path::{Path, PathBuf},
   sync::Arc,
   thread,
   time::Duration,
};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
   bridge::outbound::BridgeTx,
   error::Result,
   net::{
      buffer::PacketBuf,
      netif::{FLAG_ADMIN_UP, HostStack, InputRejected, Netif},
   },
};

/// Largest datagram the pump accepts, comfortably above any frame MTU
const RECV_BUFFER_SIZE: usize = 65536;
/// Pause before retrying after an unexpected receive error
const RECV_RETRY_PAUSE: Duration = Duration::from_millis(100);

pub struct DatagramStack {
   rx: UnixDatagram,
   tx: UnixDatagram,
   peer: Mutex<Option<PathBuf>>,
   output: Mutex<Option<BridgeTx>>,
}

impl DatagramStack {
   /// Binds the endpoint, replacing a stale socket file from a previous
   /// run.
   pub fn bind(path: &str) -> Result<Arc<Self>> {
      let path = Path::new(path);
      if path.exists() {
         fs::remove_file(path)?;
      }
      let rx = UnixDatagram::bind(path)?;
      let tx = UnixDatagram::unbound()?;
      tx.set_nonblocking(true)?;
      info!("Listening on {}", path.display());

      Ok(Arc::new(Self {
         rx,
         tx,
         peer: Mutex::new(None),
         output: Mutex::new(None),
      }))
   }

   /// Starts the thread that moves host datagrams into the bridge.
   ///
   /// The thread lives for the process lifetime and blocks inside
   /// `submit` whenever the transmit queue is full.
   pub fn spawn_pump(self: &Arc<Self>) -> Result<()> {
      let this = self.clone();
      thread::Builder::new()
         .name("host-pump".into())
         .spawn(move || this.pump())?;
      Ok(())
   }

   fn pump(&self) {
      let mut buf = vec![0u8; RECV_BUFFER_SIZE];
      loop {
         let (n, addr) = match self.rx.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) => {
               if let Some(pause) = recv_retry_delay(&e) {
                  warn!("Datagram receive failed: {e}");
                  thread::sleep(pause);
               }
               continue;
            },
         };
         if let Some(path) = addr.as_pathname() {
            *self.peer.lock() = Some(path.to_path_buf());
         }
         if n == 0 {
            continue;
         }
         let Some(output) = self.output.lock().clone() else {
            debug!("No link registered, dropping {n} byte datagram");
            continue;
         };
         output.submit(PacketBuf::from_slice(&buf[..n]));
      }
   }
}

/// Receive errors never stop the pump: interrupted reads retry at once,
/// anything else after a pause so a persistent fault cannot spin the
/// thread hot.
fn recv_retry_delay(e: &io::Error) -> Option<Duration> {
   match e.kind() {
      io::ErrorKind::Interrupted => None,
      _ => Some(RECV_RETRY_PAUSE),
   }
}

impl HostStack for DatagramStack {
   fn register_link(&self, netif: Arc<Netif>, output: BridgeTx, default_route: bool) {
      info!(
         "Attached {} (mtu {}) as datagram endpoint{}",
         netif.name(),
         netif.mtu(),
         if default_route { ", default route" } else { "" }
      );
      *self.output.lock() = Some(output);
   }

   fn input(&self, netif: &Netif, packet: PacketBuf) -> std::result::Result<(), InputRejected> {
      if netif.flags() & FLAG_ADMIN_UP == 0 || !netif.is_up() {
         return Err(InputRejected {
            packet,
            reason: "interface down",
         });
      }

      let Some(peer) = self.peer.lock().clone() else {
         return Err(InputRejected {
            packet,
            reason: "no peer attached",
         });
      };

      // Single-segment chains go out without a gather copy.
      let sent = match packet.segments() {
         [seg] => self.tx.send_to(seg.payload(), &peer),
         _ => self.tx.send_to(&packet.to_vec(), &peer),
      };
      match sent {
         Ok(_) => Ok(()),
         Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(InputRejected {
            packet,
            reason: "peer backlogged",
         }),
         Err(e) => {
            debug!("Datagram send to {} failed: {e}", peer.display());
            Err(InputRejected {
               packet,
               reason: "peer send failed",
            })
         },
      }
   }
}
