use std::env;
use std::path::{Path, PathBuf};

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let llama_cpp_dir = manifest_dir.join("../../reference/llama.cpp");
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let llguidance = env::var("CARGO_FEATURE_LLGUIDANCE").is_ok();

    // ── Locate llama.cpp ──────────────────────────────────────────────
    //
    // `LLAMA_PREBUILT_DIR` points at an install tree with `lib/` and
    // `include/`; otherwise llama.cpp is built with CMake from
    // `reference/llama.cpp`.  The CMake build directory is returned too
    // because `libcommon.a` and `libllguidance.a` are never installed.

    let (lib_dir, include_dir, build_dir) = if let Ok(prebuilt) = env::var("LLAMA_PREBUILT_DIR") {
        let prebuilt = PathBuf::from(&prebuilt);
        assert!(
            prebuilt.exists(),
            "LLAMA_PREBUILT_DIR={} does not exist",
            prebuilt.display()
        );
        let lib = pick_lib_dir(&prebuilt);
        let inc = prebuilt.join("include");
        println!(
            "cargo:warning=Using prebuilt llama.cpp from {}",
            prebuilt.display()
        );
        println!("cargo:rerun-if-env-changed=LLAMA_PREBUILT_DIR");
        (lib.clone(), inc, lib)
    } else {
        assert!(
            llama_cpp_dir.join("CMakeLists.txt").exists(),
            "llama.cpp source not found at {}. \
             Run `git submodule update --init --recursive`.",
            llama_cpp_dir.display()
        );

        let dst = cmake_build(&llama_cpp_dir, &target_os, llguidance);
        (pick_lib_dir(&dst), dst.join("include"), dst.join("build"))
    };

    // ── Shim over llama.cpp `common` (C++ linkage) ────────────────────
    //
    // Compiled before the static llama libraries are listed so the
    // linker resolves the shim's references against them.
    if llguidance {
        cc::Build::new()
            .cpp(true)
            .std("c++17")
            .file("shim/common_shim.cpp")
            .include(&include_dir)
            .include(llama_cpp_dir.join("common"))
            .include(llama_cpp_dir.join("include"))
            .include(llama_cpp_dir.join("ggml/include"))
            .include(llama_cpp_dir.join("vendor"))
            .compile("llama_shim");
        println!("cargo:rerun-if-changed=shim/common_shim.cpp");

        for (name, hint) in [("common", "common"), ("llguidance", "llguidance")] {
            match find_static_lib(&build_dir, name) {
                Some(dir) => {
                    println!("cargo:rustc-link-search=native={}", dir.display());
                    println!("cargo:rustc-link-lib=static={name}");
                }
                None => panic!(
                    "lib{name}.a not found under {} (is llama.cpp built with the {hint} target?)",
                    build_dir.display()
                ),
            }
        }
    }

    link_llama(&lib_dir, &target_os, llguidance);

    // ── Generate Rust bindings ────────────────────────────────────────
    let mut builder = bindgen::Builder::default()
        .header("wrapper.h")
        .clang_arg(format!("-I{}", include_dir.display()));

    let ggml_include = llama_cpp_dir.join("ggml/include");
    if ggml_include.exists() {
        builder = builder.clang_arg(format!("-I{}", ggml_include.display()));
    }

    let bindings = builder
        .allowlist_function("llama_.*")
        .allowlist_function("ggml_log_set")
        .allowlist_type("llama_.*")
        .allowlist_type("ggml_log_.*")
        .allowlist_var("LLAMA_.*")
        .allowlist_var("GGML_LOG_.*")
        .derive_default(true)
        .size_t_is_usize(true)
        .generate()
        .expect("Failed to generate bindings");

    let out = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out.join("bindings.rs"))
        .expect("Failed to write bindings");

    println!("cargo:rerun-if-changed=wrapper.h");
}

/// Static CMake build of llama.cpp; returns the install prefix.
fn cmake_build(src: &Path, target_os: &str, llguidance: bool) -> PathBuf {
    let feature = |name: &str| env::var(format!("CARGO_FEATURE_{name}")).is_ok();
    let on_off = |on: bool| if on { "ON" } else { "OFF" };

    let mut cfg = cmake::Config::new(src);
    for flag in [
        "BUILD_SHARED_LIBS",
        "LLAMA_BUILD_SERVER",
        "LLAMA_BUILD_TESTS",
        "LLAMA_BUILD_EXAMPLES",
        "LLAMA_BUILD_TOOLS",
        "LLAMA_CURL",
    ] {
        cfg.define(flag, "OFF");
    }
    // libcommon is only needed for the llguidance sampler shim.
    cfg.define("LLAMA_BUILD_COMMON", on_off(llguidance))
        .define("LLAMA_LLGUIDANCE", on_off(llguidance))
        .define("GGML_CUDA", on_off(feature("CUDA")))
        .define("GGML_VULKAN", on_off(feature("VULKAN")))
        .define("GGML_METAL", on_off(target_os == "macos"));

    if feature("ROCM") {
        let rocm = env::var("ROCM_PATH").unwrap_or_else(|_| "/opt/rocm".into());
        cfg.define("GGML_HIP", "ON")
            .define("CMAKE_HIP_COMPILER_ROCM_ROOT", &rocm)
            .define("CMAKE_HIP_FLAGS", format!("--rocm-path={rocm}"));
        if let Ok(targets) = env::var("AMDGPU_TARGETS") {
            cfg.define("AMDGPU_TARGETS", &targets);
        }
    }
    cfg.build()
}

/// Static GPU backend archives keyed by cargo feature, with the system
/// libraries each one pulls in.
const GPU_BACKENDS: &[(&str, &str, &[&str])] = &[
    ("CUDA", "ggml-cuda", &["cuda", "cublas", "culibos", "cudart"]),
    ("VULKAN", "ggml-vulkan", &["vulkan"]),
    (
        "ROCM",
        "ggml-hip",
        &["amdhip64", "hipblas", "hiprtc", "rocblas", "hsa-runtime64", "amd_comgr"],
    ),
];

fn link_llama(lib_dir: &Path, target_os: &str, llguidance: bool) {
    let has_archive = |name: &str| lib_dir.join(format!("lib{name}.a")).exists();

    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib=static=llama");
    ["ggml", "ggml-base", "ggml-cpu"]
        .into_iter()
        .filter(|name| has_archive(name))
        .for_each(|name| println!("cargo:rustc-link-lib=static={name}"));

    for &(feature, archive, system) in GPU_BACKENDS {
        if env::var(format!("CARGO_FEATURE_{feature}")).is_err() || !has_archive(archive) {
            continue;
        }
        println!("cargo:rustc-link-lib=static={archive}");
        if feature == "ROCM" {
            let rocm = env::var("ROCM_PATH").unwrap_or_else(|_| "/opt/rocm".into());
            println!("cargo:rustc-link-search=native={rocm}/lib");
        }
        system
            .iter()
            .for_each(|lib| println!("cargo:rustc-link-lib={lib}"));
    }

    let system: &[&str] = match target_os {
        // gomp is ggml-cpu's OpenMP runtime; dl is needed by llguidance.
        "linux" if llguidance => &["stdc++", "m", "pthread", "gomp", "dl"],
        "linux" => &["stdc++", "m", "pthread", "gomp"],
        "macos" => {
            if has_archive("ggml-metal") {
                println!("cargo:rustc-link-lib=static=ggml-metal");
            }
            for fw in ["Accelerate", "Metal", "MetalKit", "Foundation"] {
                println!("cargo:rustc-link-lib=framework={fw}");
            }
            &["c++"]
        }
        "windows" => &["msvcrt"],
        _ => &[],
    };
    for lib in system {
        println!("cargo:rustc-link-lib={lib}");
    }
}

fn pick_lib_dir(root: &Path) -> PathBuf {
    if root.join("lib64").exists() {
        root.join("lib64")
    } else {
        root.join("lib")
    }
}

/// Depth-first search for `lib<name>.a` below `root`.
fn find_static_lib(root: &Path, name: &str) -> Option<PathBuf> {
    let file = format!("lib{name}.a");
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().and_then(|f| f.to_str()) == Some(file.as_str()) {
                return Some(dir);
            }
        }
    }
    None
}
