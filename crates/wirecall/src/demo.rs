//! The demo service exposed by `wirecall serve`.

use wirerun::Service;

pub const SERVICE_NAME: &str = "Service";

pub const MAIL: &str = "vip.alexd@gmail.com";

pub fn service() -> Service {
    Service::new()
        .method("getMail", || Ok::<_, String>(MAIL))
        .method("getHostName", host_name)
        .method_async("echo", |text: String| async move { Ok::<_, String>(text) })
}

fn host_name() -> Result<String, String> {
    let name = hostname::get().map_err(|e| format!("cannot read host name: {}", e))?;
    name.into_string()
        .map_err(|raw| format!("host name is not valid unicode: {:?}", raw))
}
