use criterion::{black_box, criterion_group, criterion_main, Criterion};
use metracer_classfile::access::{ACC_PUBLIC, ACC_STATIC};
use metracer_classfile::{ClassFile, CodeAttribute, ConstantPool, MethodAttribute, MethodInfo};

/// A synthetic class with many small methods, roughly the shape of a
/// servlet-container helper class.
fn synthetic_class(methods: usize) -> Vec<u8> {
    let mut pool = ConstantPool::new();
    let this_class = pool.ensure_class("bench/Target").unwrap();
    let super_class = pool.ensure_class("java/lang/Object").unwrap();
    let code_name = pool.ensure_utf8("Code").unwrap();
    let descriptor_index = pool.ensure_utf8("(II)I").unwrap();

    let mut infos = Vec::with_capacity(methods);
    for i in 0..methods {
        let name_index = pool.ensure_utf8(&format!("method{i}")).unwrap();
        infos.push(MethodInfo {
            access_flags: ACC_STATIC,
            name_index,
            descriptor_index,
            attributes: vec![MethodAttribute::Code {
                name_index: code_name,
                code: CodeAttribute {
                    max_stack: 2,
                    max_locals: 2,
                    code: vec![0x1a, 0x1b, 0x60, 0xac],
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
        methods: infos,
        attributes: Vec::new(),
    }
    .write()
}

fn bench_parse(c: &mut Criterion) {
    let bytes = synthetic_class(64);
    c.bench_function("parse_64_methods", |b| {
        b.iter(|| ClassFile::parse(black_box(&bytes)).unwrap())
    });
}

fn bench_roundtrip(c: &mut Criterion) {
    let bytes = synthetic_class(64);
    let class = ClassFile::parse(&bytes).unwrap();
    c.bench_function("write_64_methods", |b| b.iter(|| black_box(&class).write()));
}

criterion_group!(benches, bench_parse, bench_roundtrip);
criterion_main!(benches);
