use criterion::{Criterion, criterion_group, criterion_main};
use kiln::jobs::JobScheduler;
use kiln::toolchain::parser::{GCC_PATTERNS, MSVC_PATTERNS};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const GCC_OUTPUT: &str = "\
. /usr/include/stdio.h
.. /usr/include/x86_64-linux-gnu/bits/libc-header-start.h
src/main.cpp: In function 'int main()':
src/main.cpp:12:5: error: 'foo' was not declared in this scope
src/main.cpp:14:9: warning: unused variable 'x' [-Wunused-variable]
   14 |     int x = 3;
      |         ^
/usr/bin/ld: main.o: in function `main':
main.cpp:(.text+0x1a): undefined reference to `bar()'
collect2: error: ld returned 1 exit status
";

const MSVC_OUTPUT: &str = "\
main.cpp
Note: including file: C:\\src\\util.h
C:\\src\\main.cpp(12): error C2065: 'foo': undeclared identifier
C:\\src\\main.cpp(14,9): warning C4101: 'x': unreferenced local variable
main.obj : error LNK2019: unresolved external symbol \"void __cdecl bar(void)\"
";

fn bench_output_parser(c: &mut Criterion) {
    c.bench_function("parse_gcc_output", |b| {
        b.iter(|| GCC_PATTERNS.parse(black_box(GCC_OUTPUT)))
    });
    c.bench_function("parse_msvc_output", |b| {
        b.iter(|| MSVC_PATTERNS.parse(black_box(MSVC_OUTPUT)))
    });
}

fn bench_scheduler(c: &mut Criterion) {
    let scheduler = JobScheduler::new(JobScheduler::default_threads()).unwrap();
    c.bench_function("schedule_256_job_fan_in", |b| {
        b.iter(|| {
            let counter = Arc::new(AtomicUsize::new(0));
            let host = scheduler.create_barrier().unwrap();
            for _ in 0..256 {
                let counter = Arc::clone(&counter);
                let job = scheduler
                    .create(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    })
                    .unwrap();
                scheduler.add_dependency(host, job).unwrap();
            }
            scheduler.enqueue(host).unwrap();
            scheduler.wait(host).unwrap();
            black_box(counter.load(Ordering::Relaxed))
        })
    });
}

criterion_group!(benches, bench_output_parser, bench_scheduler);
criterion_main!(benches);
