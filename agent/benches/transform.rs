//! Throughput of the bytecode rewriter, the hot path of every retransform.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use metracer_agent::transform::transform;
use metracer_classfile::access::ACC_PUBLIC;
use metracer_classfile::{ClassFile, CodeAttribute, ConstantPool, MethodAttribute, MethodInfo};
use metracer_pattern::{LoaderId, PatternSet};
use metracer_protocol::StackTraceMode;

/// A class with `count` int-returning methods, mirroring the shape of a
/// typical service class.
fn synthetic_class(count: usize) -> Vec<u8> {
    let mut pool = ConstantPool::new();
    let this_class = pool.ensure_class("bench/Subject").unwrap();
    let super_class = pool.ensure_class("java/lang/Object").unwrap();
    let code_name = pool.ensure_utf8("Code").unwrap();
    let descriptor_index = pool.ensure_utf8("(I)I").unwrap();

    let mut methods = Vec::with_capacity(count);
    for i in 0..count {
        let name_index = pool.ensure_utf8(&format!("method{:03}", i)).unwrap();
        methods.push(MethodInfo {
            access_flags: ACC_PUBLIC,
            name_index,
            descriptor_index,
            attributes: vec![MethodAttribute::Code {
                name_index: code_name,
                code: CodeAttribute {
                    max_stack: 1,
                    max_locals: 2,
                    // iload_1; ireturn
                    code: vec![0x1b, 0xac],
                    exception_table: Vec::new(),
                    attributes: Vec::new(),
                },
            }],
        });
    }

    ClassFile {
        minor_version: 0,
        major_version: 52,
        constant_pool: pool,
        access_flags: ACC_PUBLIC,
        this_class,
        super_class,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods,
        attributes: Vec::new(),
    }
    .write()
}

fn bench_transform(c: &mut Criterion) {
    let bytes = synthetic_class(64);
    let all = PatternSet::compile("bench\\..*", None, StackTraceMode::Disabled).unwrap();
    let narrow =
        PatternSet::compile("bench\\..*", Some("method00.*"), StackTraceMode::Disabled).unwrap();

    c.bench_function("transform_64_methods_all", |b| {
        b.iter(|| transform("bench.Subject", black_box(&bytes), LoaderId(0), &all).unwrap())
    });

    c.bench_function("transform_64_methods_narrow", |b| {
        b.iter(|| transform("bench.Subject", black_box(&bytes), LoaderId(0), &narrow).unwrap())
    });
}

criterion_group!(benches, bench_transform);
criterion_main!(benches);
