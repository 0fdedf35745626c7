use crate::config::ServerConfig;
use std::path::Path;
use std::process;

pub fn run(config_path: String, json_output: bool) {
    let config = ServerConfig::load(Path::new(&config_path))
        .and_then(|config| config.validate().map(|()| config))
        .unwrap_or_else(|e| {
            eprintln!("error: {e}");
            process::exit(1);
        });

    if json_output {
        let rendered = serde_json::to_string_pretty(&config.redacted()).unwrap_or_else(|e| {
            eprintln!("error: failed to render config: {e}");
            process::exit(1);
        });
        println!("{rendered}");
        return;
    }

    let managers = config.users.iter().filter(|user| user.manager).count();
    println!("scv check-config");
    println!("  Config: {config_path}");
    println!("  Name: {}", config.name);
    println!("  Bind: {}", config.bind);
    println!("  Data dir: {}", config.data_dir().display());
    println!("  Expiration: {}s", config.expiration_seconds);
    println!("  Max stream fails: {}", config.max_stream_fails);
    println!("  Users: {} ({managers} managers)", config.users.len());
    println!("  Result: ok");
}
