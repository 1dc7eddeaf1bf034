//! Print a one-line summary of every message visible on the system bus.
//!
//! Run with `RUST_LOG=debug cargo run --example monitor`.

use ayla_dbus_client::Client;
use ayla_reactor::Reactor;
use std::rc::Rc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let reactor = Rc::new(Reactor::new()?);
    let client = Client::connect(reactor.clone())?;
    client.set_message_trace(true);

    // An unfiltered handler sees everything the bus routes to us.
    client.add_filter(None, |msg| {
        println!("{}", ayla_dbus_client::args::describe(msg));
    })?;

    reactor.run()?;
    Ok(())
}
