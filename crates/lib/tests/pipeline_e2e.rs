//! End-to-end pipeline tests.
//!
//! The network is a mockito server handing out in-test tarballs, and the
//! toolchain is a set of stub shell scripts, so the full pipeline runs
//! without touching the real world: fetch → verify → stage → synthesize →
//! configure → compile → install → verify.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};

use keg_lib::digest::hash_bytes;
use keg_lib::formula::{Formula, InstallStep, Resource, SourceSpec, TestSpec};
use keg_lib::pipeline::{self, BuildConfig, BuildError, Stage};
use tempfile::TempDir;

/// Build a gzipped tarball with the given (path, content) entries.
fn tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
  use flate2::Compression;
  use flate2::write::GzEncoder;

  let encoder = GzEncoder::new(Vec::new(), Compression::default());
  let mut builder = tar::Builder::new(encoder);

  for (path, content) in entries {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, content.as_bytes()).unwrap();
  }

  builder.into_inner().unwrap().finish().unwrap()
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
  use std::os::unix::fs::PermissionsExt;

  let path = dir.join(name);
  fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
  fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
  path
}

/// A stub cmake: verifies the synthesized descriptor and the staged
/// resource, then records the install prefix for the stub make.
fn stub_cmake(dir: &Path) -> PathBuf {
  write_script(
    dir,
    "cmake.sh",
    r#"desc="$1/CMakeLists.txt"
test -f "$desc" || exit 1
grep -q "VERSION 3.1.5" "$desc" || exit 2
grep -q "SOVERSION 3" "$desc" || exit 3
grep -q "SHARED" "$desc" || exit 4
test -f "$1/../modules/asio-standalone/asio/include/asio.hpp" || exit 5
prefix=""
for arg in "$@"; do
  case "$arg" in
    -DCMAKE_INSTALL_PREFIX=*) prefix="${arg#-DCMAKE_INSTALL_PREFIX=}" ;;
  esac
done
test -n "$prefix" || exit 6
printf '%s' "$prefix" > prefix.txt"#,
  )
}

/// A stub make: `make` marks compilation, `make install` lays out the
/// installed artifact under the recorded prefix.
fn stub_make(dir: &Path) -> PathBuf {
  write_script(
    dir,
    "make.sh",
    r#"if [ "$1" = "install" ]; then
  test -f compiled || exit 1
  prefix="$(cat prefix.txt)"
  mkdir -p "$prefix/include" "$prefix/lib"
  printf '/* abl_link public interface */\n' > "$prefix/include/abl_link.h"
  printf 'shared library placeholder\n' > "$prefix/lib/libabl_link.so.3.1.5"
  ln -sf libabl_link.so.3.1.5 "$prefix/lib/libabl_link.so.3"
  ln -sf libabl_link.so.3 "$prefix/lib/libabl_link.so"
else
  test -f prefix.txt || exit 1
  touch compiled
fi"#,
  )
}

/// A stub compiler: checks the install layout it is pointed at, then writes
/// a runnable program to the `-o` path.
fn stub_cc(dir: &Path) -> PathBuf {
  write_script(
    dir,
    "cc.sh",
    r#"out=""; inc=""; lib=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
    -I*) inc="${1#-I}" ;;
    -L*) lib="${1#-L}" ;;
  esac
  shift
done
test -f "$inc/abl_link.h" || exit 1
test -e "$lib/libabl_link.so" || exit 1
printf '#!/bin/sh\nexit 0\n' > "$out"
chmod +x "$out""#,
  )
}

const DESCRIPTOR_TEMPLATE: &str = r#"cmake_minimum_required(VERSION 3.10)
project(abl_link_shared)

include($${source_dir}/AbletonLinkConfig.cmake)

add_library(abl_link SHARED
  $${source_dir}/extensions/abl_link/src/abl_link.cpp
)

target_include_directories(abl_link PUBLIC
  $${source_dir}/extensions/abl_link/include
)

set_target_properties(abl_link PROPERTIES
  VERSION $${version}
  SOVERSION $${soversion}
)
"#;

const SMOKE_TEST: &str = r#"#include <abl_link.h>
#include <stddef.h>

int main(void) {
  abl_link link = abl_link_create(120.0);
  if (link.impl == NULL) {
    return 1;
  }
  abl_link_destroy(link);
  return 0;
}
"#;

fn source_archive() -> Vec<u8> {
  tar_gz(&[
    ("link-3.1.5/AbletonLinkConfig.cmake", "# link config\n"),
    ("link-3.1.5/extensions/abl_link/src/abl_link.cpp", "// impl\n"),
    ("link-3.1.5/extensions/abl_link/include/abl_link.h", "/* header */\n"),
  ])
}

fn asio_archive() -> Vec<u8> {
  tar_gz(&[("asio-1.28.0/asio/include/asio.hpp", "// asio\n")])
}

fn formula(server_url: &str, source_sha: &str, asio_sha: &str) -> Formula {
  Formula {
    name: "abl-link".to_string(),
    description: "C11 wrapper for Ableton Link".to_string(),
    homepage: "https://github.com/Ableton/link".to_string(),
    version: "3.1.5".to_string(),
    license: "GPL-2.0-or-later".to_string(),
    source: SourceSpec {
      url: format!("{server_url}/link-3.1.5.tar.gz"),
      sha256: source_sha.to_string(),
    },
    build_dependencies: vec!["cmake".to_string(), "make".to_string()],
    resources: vec![Resource {
      name: "asio".to_string(),
      url: format!("{server_url}/asio.tar.gz"),
      sha256: asio_sha.to_string(),
    }],
    install: vec![
      InstallStep::Stage {
        resource: "asio".to_string(),
        dest: "modules/asio-standalone".to_string(),
      },
      InstallStep::Render {
        dest: "build_shared/CMakeLists.txt".to_string(),
        template: DESCRIPTOR_TEMPLATE.to_string(),
      },
      InstallStep::Build {
        subdir: "build_shared/build".to_string(),
        descriptor_dir: "build_shared".to_string(),
      },
    ],
    test: TestSpec {
      source: SMOKE_TEST.to_string(),
      link: "abl_link".to_string(),
    },
  }
}

fn config(temp: &TempDir, scripts: &Path) -> BuildConfig {
  let mut config = BuildConfig::new(temp.path().join("prefix"));
  config.cache_dir = temp.path().join("cache");
  config.std_args = vec!["-DCMAKE_BUILD_TYPE=Release".to_string()];
  config.toolchain.cmake = stub_cmake(scripts).display().to_string();
  config.toolchain.make = stub_make(scripts).display().to_string();
  config.toolchain.cc = stub_cc(scripts).display().to_string();
  config
}

#[tokio::test]
async fn full_pipeline_builds_and_verifies() {
  let temp = TempDir::new().unwrap();
  let scripts = temp.path().join("bin");
  fs::create_dir(&scripts).unwrap();

  let source = source_archive();
  let asio = asio_archive();

  let mut server = mockito::Server::new_async().await;
  server
    .mock("GET", "/link-3.1.5.tar.gz")
    .with_body(source.clone())
    .create_async()
    .await;
  server.mock("GET", "/asio.tar.gz").with_body(asio.clone()).create_async().await;

  let formula = formula(&server.url(), &hash_bytes(&source), &hash_bytes(&asio));
  let config = config(&temp, &scripts);

  let report = pipeline::build_formula(&formula, &config).await.unwrap();

  assert_eq!(report.name, "abl-link");
  assert_eq!(report.version, "3.1.5");
  assert_eq!(report.soversion, 3);

  // Installed artifact layout: headers and a versioned shared library.
  let prefix = &config.prefix;
  assert!(prefix.join("include/abl_link.h").exists());
  assert!(prefix.join("lib/libabl_link.so.3.1.5").exists());
  assert!(prefix.join("lib/libabl_link.so").exists());

  // Every stage ran, in pipeline order.
  let stages: Vec<Stage> = report.stages.iter().map(|t| t.stage).collect();
  assert_eq!(
    stages,
    vec![
      Stage::Fetching,
      Stage::Staging,
      Stage::Synthesizing,
      Stage::Configuring,
      Stage::Compiling,
      Stage::Installing,
      Stage::Verifying,
    ]
  );
}

#[tokio::test]
async fn corrupted_source_digest_aborts_at_fetching() {
  let temp = TempDir::new().unwrap();
  let scripts = temp.path().join("bin");
  fs::create_dir(&scripts).unwrap();

  let source = source_archive();
  let asio = asio_archive();

  let mut server = mockito::Server::new_async().await;
  server
    .mock("GET", "/link-3.1.5.tar.gz")
    .with_body(source.clone())
    .create_async()
    .await;
  server.mock("GET", "/asio.tar.gz").with_body(asio.clone()).create_async().await;

  // Flip one character of the declared source digest.
  let mut bad_sha = hash_bytes(&source);
  let flipped = if bad_sha.ends_with('0') { "1" } else { "0" };
  bad_sha.replace_range(bad_sha.len() - 1.., flipped);

  let formula = formula(&server.url(), &bad_sha, &hash_bytes(&asio));
  let config = config(&temp, &scripts);

  let err = pipeline::build_formula(&formula, &config).await.unwrap_err();

  assert_eq!(err.stage, Stage::Fetching);
  assert!(matches!(
    err.source,
    BuildError::Fetch(keg_lib::fetch::FetchError::Digest { .. })
  ));

  // Nothing was staged or installed.
  assert!(!config.prefix.exists());
  // Nothing was published to the cache under the bad digest.
  let cache = keg_lib::cache::DownloadCache::new(&config.cache_dir);
  assert!(cache.lookup(&formula.source.url, &bad_sha).is_none());
}

#[tokio::test]
async fn failing_compile_surfaces_stage_and_skips_install() {
  let temp = TempDir::new().unwrap();
  let scripts = temp.path().join("bin");
  fs::create_dir(&scripts).unwrap();

  let source = source_archive();
  let asio = asio_archive();

  let mut server = mockito::Server::new_async().await;
  server
    .mock("GET", "/link-3.1.5.tar.gz")
    .with_body(source.clone())
    .create_async()
    .await;
  server.mock("GET", "/asio.tar.gz").with_body(asio.clone()).create_async().await;

  let formula = formula(&server.url(), &hash_bytes(&source), &hash_bytes(&asio));
  let mut config = config(&temp, &scripts);
  config.toolchain.make = write_script(&scripts, "broken-make.sh", "echo 'cc1: fatal error' >&2; exit 2")
    .display()
    .to_string();

  let err = pipeline::build_formula(&formula, &config).await.unwrap_err();

  assert_eq!(err.stage, Stage::Compiling);
  // The install step never ran, so the prefix was never populated.
  assert!(!config.prefix.exists());
}
