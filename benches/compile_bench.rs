use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wcc::compiler::{CompileOptions, Compiler};
use wcc::Scanner;

const PROGRAM: &str = r#"
struct Shape { virtual int area(void); int id; };
struct Rect : Shape { int w; int h; int area(void) { return w * h; } };
int Shape::area(void) { return 0; }

int table[16];

int fib(int n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }

int sum(struct Shape *s, int n) {
    int total = 0;
    int i;
    for (i = 0; i < n; i++) {
        switch (i & 3) {
        case 0: total += s->area(); break;
        case 1: total -= table[i]; break;
        default: total += fib(i);
        }
    }
    return total;
}

int guarded(int x) {
    int r = 0;
    try { if (x > 3) throw x; r = x * 2; } catch (int e) { r = e; }
    return r;
}
"#;

fn lexer_benchmark(c: &mut Criterion) {
    c.bench_function("tokenize program", |b| {
        b.iter(|| Scanner::new(black_box(PROGRAM), "bench.c").scan_tokens())
    });
}

fn compile_benchmark(c: &mut Criterion) {
    let optimized = Compiler::new(CompileOptions::default());
    let unoptimized = Compiler::new(CompileOptions {
        opt_level: 0,
        ..CompileOptions::default()
    });

    c.bench_function("compile program -O1", |b| {
        b.iter(|| optimized.compile(black_box(PROGRAM)).map(|r| r.code_words))
    });
    c.bench_function("compile program -O0", |b| {
        b.iter(|| unoptimized.compile(black_box(PROGRAM)).map(|r| r.code_words))
    });
}

criterion_group!(benches, lexer_benchmark, compile_benchmark);
criterion_main!(benches);
