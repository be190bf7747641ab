//! WGSL assembly.
//!
//! A kernel module is the shared prelude, generated storage bindings with
//! `ldN`/`stN` accessors for every signature slot, the kernel's own `body`
//! function and the common entry point. The result goes through a line
//! preprocessor that substitutes `{{T}}` and keeps or drops
//! `//#if COMPLEX` / `//#else` / `//#endif` sections.

use core::fmt::Write as _;

use crate::device::kernel::{KernelId, KernelKey};

const PRELUDE: &str = include_str!("shaders/prelude.wgsl");
const ENTRY: &str = include_str!("shaders/entry.wgsl");

macro_rules! bodies {
    ($($id:ident => $file:literal),* $(,)?) => {
        fn body(id: KernelId) -> &'static str {
            match id {
                $(KernelId::$id => include_str!(concat!("shaders/", $file, ".wgsl")),)*
            }
        }
    };
}

bodies! {
    Fill => "fill",
    Copy => "copy",
    Axpby => "axpby",
    Scale => "scale",
    Hadamard => "hadamard",
    Conj => "conj",
    Transpose => "transpose",
    AddRow => "add_row",
    Abs => "abs",
    Abs2 => "abs2",
    Sign => "sign",
    Sigmoid => "sigmoid",
    Tanh => "tanh",
    Relu => "relu",
    LeakyRelu => "leaky_relu",
    Softmax => "softmax",
    SigmoidGrad => "sigmoid_grad",
    TanhGrad => "tanh_grad",
    ReluGrad => "relu_grad",
    LeakyReluGrad => "leaky_relu_grad",
    SoftmaxGrad => "softmax_grad",
    FoldRows => "fold_rows",
    FoldCols => "fold_cols",
    Diagonal => "diagonal",
    Gemm => "gemm",
    GjPivot => "gj_pivot",
    GjNormalize => "gj_normalize",
    GjEliminate => "gj_eliminate",
    SgdStep => "sgd_step",
    MomentumStep => "momentum_step",
    NesterovStep => "nesterov_step",
    AdagradStep => "adagrad_step",
    RmspropStep => "rmsprop_step",
    AdadeltaStep => "adadelta_step",
    AdamStep => "adam_step",
}

/// Storage declarations and accessors for the signature of `key`.
///
/// Binding 0 is the parameter block; storage bindings follow from 1 in
/// signature order, a complex paired slot taking two.
fn bindings(key: KernelKey) -> String {
    let mut out = String::new();
    let mut binding = 1;
    for (i, slot) in key.id.signature().iter().enumerate() {
        let imag = key.complex && slot.paired;
        let _ = writeln!(
            out,
            "@group(0) @binding({binding}) var<storage, read_write> op{i}_re: array<{{{{T}}}}>;"
        );
        binding += 1;
        if imag {
            let _ = writeln!(
                out,
                "@group(0) @binding({binding}) var<storage, read_write> op{i}_im: array<{{{{T}}}}>;"
            );
            binding += 1;
        }

        let load_im = if imag { format!("op{i}_im[k]") } else { "0.0".to_owned() };
        let _ = writeln!(
            out,
            "fn ld{i}(r: u32, c: u32) -> cplx {{\n    let k = at({i}u, r, c);\n    return cplx(op{i}_re[k], {load_im});\n}}"
        );
        if slot.access.writes() {
            let store_im = if imag {
                format!("\n    op{i}_im[k] = v.y;")
            } else {
                String::new()
            };
            let _ = writeln!(
                out,
                "fn st{i}(r: u32, c: u32, v: cplx) {{\n    let k = at({i}u, r, c);\n    op{i}_re[k] = v.x;{store_im}\n}}"
            );
        }
    }
    out
}

/// Expands `{{T}}` and resolves `//#if COMPLEX` sections.
pub(super) fn preprocess(source: &str, complex: bool, scalar: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut active: Vec<bool> = Vec::new();
    for line in source.lines() {
        match line.trim() {
            "//#if COMPLEX" => active.push(complex),
            "//#else" => {
                if let Some(top) = active.last_mut() {
                    *top = !*top;
                }
            }
            "//#endif" => {
                active.pop();
            }
            _ if active.iter().all(|&on| on) => {
                out.push_str(&line.replace("{{T}}", scalar));
                out.push('\n');
            }
            _ => {}
        }
    }
    out
}

/// Full WGSL module for `key` with `scalar` as the element type.
pub(super) fn render(key: KernelKey, scalar: &str) -> String {
    let source = [PRELUDE, &bindings(key), body(key.id), ENTRY].join("\n");
    preprocess(&source, key.complex, scalar)
}
