// Copyright 2018-2025 the Deno authors. MIT license.

use std::io;
use std::sync::Arc;

use crate::connection::Connection;
use crate::session::Session;
use crate::transport::Listener;

/// Accept loop plus one worker thread per connection. Sessions share
/// nothing; a slow or blocked native call only stalls its own worker.
pub struct Server {
  listener: Arc<Listener>,
}

impl Server {
  pub fn bind(name: &str) -> io::Result<Server> {
    let listener = Listener::bind(name)?;
    Ok(Server {
      listener: Arc::new(listener),
    })
  }

  pub fn endpoint(&self) -> String {
    self.listener.endpoint()
  }

  /// Blocks accepting connections until [`Server::stop`] is called.
  pub fn run(&self) {
    log::info!("listening on {}", self.endpoint());
    loop {
      match self.listener.accept() {
        Ok(Some(stream)) => {
          let connection = Arc::new(Connection::new(stream.writer));
          let session = Session::new(connection);
          let reader = stream.reader;
          let spawned = std::thread::Builder::new()
            .name("nexec-session".to_string())
            .spawn(move || session.run(reader));
          if let Err(e) = spawned {
            log::error!("failed to spawn session worker: {e}");
          }
        }
        Ok(None) => break,
        Err(e) => {
          log::warn!("accept failed: {e}");
        }
      }
    }
    log::info!("listener stopped");
  }

  pub fn stop(&self) {
    self.listener.stop();
  }
}
