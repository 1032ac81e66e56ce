//! Bundling with relative entry points
//!
//! Changing the process working directory affects every thread, so this
//! lives in its own test binary with a single test.

use pretty_assertions::assert_eq;
use somon_modules::{BundleRequest, ModuleSystem, ModuleSystemConfig};
use std::env;
use std::fs;
use std::path::Path;

const GREETER: &[(&str, &str)] = &[
    (
        "lib/greet.som",
        "содирот функсия салом(ном) {\n  бозгашт \"Салом, \" + ном;\n}",
    ),
    (
        "main.som",
        "воридот { салом } аз \"./lib/greet\";\nчоп.сабт(салом(\"Ҷаҳон\"));",
    ),
];

fn bundle_request(entry: &Path) -> BundleRequest {
    BundleRequest {
        source_maps: true,
        inline_sources: true,
        ..BundleRequest::new(entry)
    }
}

#[tokio::test]
async fn test_relative_entry_follows_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    for (name, contents) in GREETER {
        let path = dir.path().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
    let original = env::current_dir().unwrap();
    let system = ModuleSystem::new(ModuleSystemConfig::default()).unwrap();

    env::set_current_dir(dir.path()).unwrap();
    let from_root = system.bundle(&bundle_request(Path::new("main.som"))).await;

    env::set_current_dir(dir.path().join("lib")).unwrap();
    let from_lib = system.bundle(&bundle_request(Path::new("../main.som"))).await;

    env::set_current_dir(&original).unwrap();
    let absolute = system
        .bundle(&bundle_request(&dir.path().join("main.som")))
        .await
        .unwrap();

    let from_root = from_root.unwrap();
    let from_lib = from_lib.unwrap();
    assert_eq!(from_root, absolute);
    assert_eq!(from_lib, absolute);
    assert!(absolute.code.contains("\"./lib/greet.som\""));
}
