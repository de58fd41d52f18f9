//! A minimal mock-up for hickory_resolver, used only to drive the
//! reachability probe's DNS leg from tests without real network access.

#[derive(Clone, Copy, Debug)]
pub struct Resolver {
    pub resolves: bool,
}

impl Resolver {
    pub async fn lookup_ip(&self, _host: &str) -> Result<(), ()> {
        if self.resolves { Ok(()) } else { Err(()) }
    }
}
