//! W16 simulator for end-to-end tests
//!
//! Assembles the text `wcc` emits into one flat word-addressed memory and
//! runs it. Calls to symbols the assembly does not define are routed to
//! native implementations of the runtime helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use wcc::compiler::{CompileOptions, Compiler};

const CODE_BASE: u16 = 0x0010;
const TRYMARK_ADDR: u16 = 0x0008;
const STACK_TOP: u16 = 0xf000;
const HELPER_BASE: u16 = 0xff00;
const HALT: u16 = 0xfffe;
const STEP_LIMIT: u64 = 5_000_000;

#[derive(Debug, Clone)]
enum Ins {
    Alu(String, usize, usize, usize),
    Unary(String, usize, usize),
    Addi(usize, usize, i32),
    Load(usize, String),
    Ld(usize, usize, i32),
    St(usize, usize, i32),
    Bcc(String, usize, usize, String),
    Bz(bool, usize, String),
    Jmp(String),
    Call(String),
    Callr(usize),
    Jr(usize),
    Ret,
}

/// Resolved form of `Ins`, targets turned into addresses
#[derive(Debug, Clone)]
enum Op {
    Alu(String, usize, usize, usize),
    Unary(String, usize, usize),
    Addi(usize, usize, i32),
    Ldi(usize, u16),
    Ld(usize, usize, i32),
    St(usize, usize, i32),
    Bcc(String, usize, usize, u16),
    Bz(bool, usize, u16),
    Jmp(u16),
    Call(u16),
    Callr(usize),
    Jr(usize),
    Ret,
}

fn reg(s: &str) -> Result<usize, String> {
    match s.trim() {
        "sp" => Ok(7),
        r if r.starts_with('r') => r[1..]
            .parse::<usize>()
            .ok()
            .filter(|n| *n < 7)
            .ok_or_else(|| format!("bad register '{}'", s)),
        _ => Err(format!("bad register '{}'", s)),
    }
}

fn imm(s: &str) -> Result<i32, String> {
    s.trim()
        .trim_start_matches('#')
        .parse::<i32>()
        .map_err(|_| format!("bad immediate '{}'", s))
}

/// `disp(reg)`
fn mem_operand(s: &str) -> Result<(i32, usize), String> {
    let open = s.find('(').ok_or_else(|| format!("bad memory operand '{}'", s))?;
    let disp = s[..open].parse::<i32>().map_err(|_| format!("bad displacement '{}'", s))?;
    let base = reg(s[open + 1..].trim_end_matches(')'))?;
    Ok((disp, base))
}

fn parse_ins(mnemonic: &str, ops: &[&str]) -> Result<Ins, String> {
    let arg = |i: usize| -> Result<&str, String> {
        ops.get(i)
            .copied()
            .ok_or_else(|| format!("'{}' is missing operand {}", mnemonic, i + 1))
    };
    Ok(match mnemonic {
        "add" | "sub" | "and" | "or" | "xor" | "shl" | "shr" | "sar" => {
            Ins::Alu(mnemonic.into(), reg(arg(0)?)?, reg(arg(1)?)?, reg(arg(2)?)?)
        }
        "mov" | "neg" | "not" | "sxb" | "zxb" => Ins::Unary(mnemonic.into(), reg(arg(0)?)?, reg(arg(1)?)?),
        "addi" => Ins::Addi(reg(arg(0)?)?, reg(arg(1)?)?, imm(arg(2)?)?),
        "ldi" | "ldl" | "lea" => Ins::Load(reg(arg(0)?)?, arg(1)?.trim_start_matches('#').to_string()),
        "ld" => {
            let (d, b) = mem_operand(arg(1)?)?;
            Ins::Ld(reg(arg(0)?)?, b, d)
        }
        "st" => {
            let (d, b) = mem_operand(arg(1)?)?;
            Ins::St(reg(arg(0)?)?, b, d)
        }
        "beq" | "bne" | "blt" | "bge" | "bltu" | "bgeu" => {
            Ins::Bcc(mnemonic.into(), reg(arg(0)?)?, reg(arg(1)?)?, arg(2)?.to_string())
        }
        "bz" | "bnz" => Ins::Bz(mnemonic == "bnz", reg(arg(0)?)?, arg(1)?.to_string()),
        "br" | "jmp" => Ins::Jmp(arg(0)?.to_string()),
        "call" => Ins::Call(arg(0)?.to_string()),
        "callr" => Ins::Callr(reg(arg(0)?)?),
        "jr" => Ins::Jr(reg(arg(0)?)?),
        "ret" => Ins::Ret,
        other => return Err(format!("unknown mnemonic '{}'", other)),
    })
}

fn ins_size(mnemonic: &str) -> u16 {
    match mnemonic {
        "jmp" | "call" | "ldl" => 2,
        _ => 1,
    }
}

/// Simulated machine with a loaded program
pub struct Machine {
    pub mem: Vec<u16>,
    pub regs: [u16; 8],
    pc: u16,
    symbols: HashMap<String, u16>,
    code: HashMap<u16, (Op, u16)>,
    helpers: HashMap<u16, String>,
    pub steps: u64,
}

impl Machine {
    /// Assembles `asm` and loads it
    pub fn load(asm: &str) -> Result<Self, String> {
        let mut symbols = HashMap::new();
        symbols.insert("__trymark".to_string(), TRYMARK_ADDR);
        let mut pending: Vec<(u16, Ins, u16)> = Vec::new();
        let mut data: Vec<(u16, String)> = Vec::new();
        let mut at = CODE_BASE;

        for raw in asm.lines() {
            let line = raw.trim_end();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            if !line.starts_with('\t') {
                let name = line.strip_suffix(':').ok_or_else(|| format!("bad line '{}'", line))?;
                symbols.insert(name.to_string(), at);
                continue;
            }
            let body = line.trim_start();
            let (mnemonic, rest) = match body.find('\t') {
                Some(i) => (&body[..i], body[i + 1..].trim()),
                None => (body, ""),
            };
            match mnemonic {
                ".psect" | ".global" => {}
                ".word" => {
                    data.push((at, rest.to_string()));
                    at += 1;
                }
                ".blkw" => {
                    at += rest.parse::<u16>().map_err(|_| format!("bad .blkw '{}'", rest))?;
                }
                _ => {
                    let ops: Vec<&str> = if rest.is_empty() { Vec::new() } else { rest.split(',').collect() };
                    let ins = parse_ins(mnemonic, &ops)?;
                    let size = ins_size(mnemonic);
                    pending.push((at, ins, size));
                    at += size;
                }
            }
        }

        let mut m = Machine {
            mem: vec![0; 0x10000],
            regs: [0; 8],
            pc: 0,
            symbols,
            code: HashMap::new(),
            helpers: HashMap::new(),
            steps: 0,
        };
        for (addr, text) in data {
            let v = m.value(&text, addr, true)?;
            m.mem[addr as usize] = v;
        }
        for (addr, ins, size) in pending {
            let op = m.resolve(ins, addr)?;
            m.code.insert(addr, (op, size));
        }
        Ok(m)
    }

    /// Value of a number, `.+n`, `symbol` or `symbol+n`
    fn value(&mut self, text: &str, at: u16, call: bool) -> Result<u16, String> {
        let text = text.trim();
        if let Some(rel) = text.strip_prefix(".+") {
            return Ok(at.wrapping_add(rel.parse::<u16>().map_err(|_| format!("bad '{}'", text))?));
        }
        if let Ok(v) = text.parse::<i32>() {
            return Ok(v as u16);
        }
        let split = text[1..].find(['+', '-']).map(|i| i + 1);
        let (name, offset) = match split {
            Some(i) => (&text[..i], text[i..].trim_start_matches('+').parse::<i32>().map_err(|_| format!("bad '{}'", text))?),
            None => (text, 0),
        };
        let base = match self.symbols.get(name) {
            Some(a) => *a,
            None if call => self.helper(name),
            None => return Err(format!("undefined symbol '{}'", name)),
        };
        Ok(base.wrapping_add(offset as u16))
    }

    fn helper(&mut self, name: &str) -> u16 {
        let addr = HELPER_BASE + self.helpers.len() as u16;
        self.helpers.insert(addr, name.to_string());
        self.symbols.insert(name.to_string(), addr);
        addr
    }

    fn resolve(&mut self, ins: Ins, at: u16) -> Result<Op, String> {
        Ok(match ins {
            Ins::Alu(o, d, a, b) => Op::Alu(o, d, a, b),
            Ins::Unary(o, d, a) => Op::Unary(o, d, a),
            Ins::Addi(d, a, i) => Op::Addi(d, a, i),
            Ins::Load(d, t) => Op::Ldi(d, self.value(&t, at, false)?),
            Ins::Ld(d, b, o) => Op::Ld(d, b, o),
            Ins::St(s, b, o) => Op::St(s, b, o),
            Ins::Bcc(c, a, b, t) => Op::Bcc(c, a, b, self.value(&t, at, false)?),
            Ins::Bz(nz, a, t) => Op::Bz(nz, a, self.value(&t, at, false)?),
            Ins::Jmp(t) => Op::Jmp(self.value(&t, at, true)?),
            Ins::Call(t) => Op::Call(self.value(&t, at, true)?),
            Ins::Callr(r) => Op::Callr(r),
            Ins::Jr(r) => Op::Jr(r),
            Ins::Ret => Op::Ret,
        })
    }

    /// Address of a symbol
    pub fn symbol(&self, name: &str) -> Option<u16> {
        self.symbols.get(name).copied()
    }

    /// Word at `symbol + offset`
    pub fn peek(&self, name: &str, offset: u16) -> Option<u16> {
        self.symbol(name).map(|a| self.mem[a.wrapping_add(offset) as usize])
    }

    fn push(&mut self, v: u16) {
        self.regs[7] = self.regs[7].wrapping_sub(1);
        self.mem[self.regs[7] as usize] = v;
    }

    fn pop(&mut self) -> u16 {
        let v = self.mem[self.regs[7] as usize];
        self.regs[7] = self.regs[7].wrapping_add(1);
        v
    }

    fn addr(&self, base: usize, disp: i32) -> usize {
        self.regs[base].wrapping_add(disp as u16) as usize
    }

    /// Calls `name` with one-word arguments and returns `r0`
    pub fn call(&mut self, name: &str, args: &[i16]) -> Result<i16, String> {
        let entry = self.symbol(name).ok_or_else(|| format!("no function '{}'", name))?;
        self.regs[7] = STACK_TOP;
        let n = args.len() as u16;
        self.regs[7] -= n;
        for (i, a) in args.iter().enumerate() {
            self.mem[self.regs[7] as usize + i] = *a as u16;
        }
        self.push(HALT);
        self.pc = entry;
        while self.pc != HALT {
            self.step()?;
        }
        if self.regs[7] != STACK_TOP - n {
            return Err(format!("stack pointer {:#x} not restored", self.regs[7]));
        }
        Ok(self.regs[0] as i16)
    }

    fn step(&mut self) -> Result<(), String> {
        self.steps += 1;
        if self.steps > STEP_LIMIT {
            return Err("step limit exceeded".into());
        }
        if let Some(name) = self.helpers.get(&self.pc).cloned() {
            self.run_helper(&name)?;
            self.pc = self.pop();
            return Ok(());
        }
        let (op, size) = self
            .code
            .get(&self.pc)
            .cloned()
            .ok_or_else(|| format!("no instruction at {:#x}", self.pc))?;
        let next = self.pc.wrapping_add(size);
        self.pc = next;
        let r = &mut self.regs;
        match op {
            Op::Alu(o, d, a, b) => {
                let (x, y) = (r[a], r[b]);
                r[d] = match o.as_str() {
                    "add" => x.wrapping_add(y),
                    "sub" => x.wrapping_sub(y),
                    "and" => x & y,
                    "or" => x | y,
                    "xor" => x ^ y,
                    "shl" => x << (y & 0xf),
                    "shr" => x >> (y & 0xf),
                    _ => ((x as i16) >> (y & 0xf)) as u16,
                };
            }
            Op::Unary(o, d, a) => {
                let x = r[a];
                r[d] = match o.as_str() {
                    "mov" => x,
                    "neg" => x.wrapping_neg(),
                    "not" => !x,
                    "sxb" => x as u8 as i8 as i16 as u16,
                    _ => x & 0xff,
                };
            }
            Op::Addi(d, a, i) => r[d] = r[a].wrapping_add(i as u16),
            Op::Ldi(d, v) => r[d] = v,
            Op::Ld(d, b, o) => {
                let at = self.addr(b, o);
                self.regs[d] = self.mem[at];
            }
            Op::St(s, b, o) => {
                let at = self.addr(b, o);
                self.mem[at] = self.regs[s];
            }
            Op::Bcc(c, a, b, t) => {
                let (x, y) = (r[a], r[b]);
                let taken = match c.as_str() {
                    "beq" => x == y,
                    "bne" => x != y,
                    "blt" => (x as i16) < (y as i16),
                    "bge" => (x as i16) >= (y as i16),
                    "bltu" => x < y,
                    _ => x >= y,
                };
                if taken {
                    self.pc = t;
                }
            }
            Op::Bz(nz, a, t) => {
                if (r[a] != 0) == nz {
                    self.pc = t;
                }
            }
            Op::Jmp(t) => self.pc = t,
            Op::Call(t) => {
                self.push(next);
                self.pc = t;
            }
            Op::Callr(a) => {
                let t = self.regs[a];
                self.push(next);
                self.pc = t;
            }
            Op::Jr(a) => self.pc = self.regs[a],
            Op::Ret => self.pc = self.pop(),
        }
        Ok(())
    }

    fn read32(&self, at: u16) -> u32 {
        self.mem[at as usize] as u32 | (self.mem[at.wrapping_add(1) as usize] as u32) << 16
    }

    fn write32(&mut self, at: u16, v: u32) {
        self.mem[at as usize] = v as u16;
        self.mem[at.wrapping_add(1) as usize] = (v >> 16) as u16;
    }

    fn run_helper(&mut self, name: &str) -> Result<(), String> {
        let [r0, r1, r2, ..] = self.regs;
        let zero = || format!("{}: division by zero", name);
        match name {
            "__mul" => self.regs[0] = r0.wrapping_mul(r1),
            "__div" => self.regs[0] = (r0 as i16).checked_div(r1 as i16).ok_or_else(zero)? as u16,
            "__mod" => self.regs[0] = (r0 as i16).checked_rem(r1 as i16).ok_or_else(zero)? as u16,
            "__divu" => self.regs[0] = r0.checked_div(r1).ok_or_else(zero)?,
            "__modu" => self.regs[0] = r0.checked_rem(r1).ok_or_else(zero)?,
            "__blkcpy" => {
                for i in 0..r2 {
                    self.mem[r0.wrapping_add(i) as usize] = self.mem[r1.wrapping_add(i) as usize];
                }
            }
            "__blkclr" => {
                for i in 0..r1 {
                    self.mem[r0.wrapping_add(i) as usize] = 0;
                }
            }
            "__cmp_l" | "__cmp_ul" => {
                let (a, b) = (self.read32(r0), self.read32(r1));
                let ord = if name == "__cmp_l" { (a as i32).cmp(&(b as i32)) } else { a.cmp(&b) };
                self.regs[0] = ord as i8 as i16 as u16;
            }
            _ => {
                let Some(body) = name.strip_prefix("__") else {
                    return Err(format!("call to undefined '{}'", name));
                };
                let (op, sfx) = body
                    .rsplit_once('_')
                    .ok_or_else(|| format!("call to undefined '{}'", name))?;
                if sfx != "l" && sfx != "ul" {
                    return Err(format!("unsupported runtime helper '{}'", name));
                }
                let signed = sfx == "l";
                let a = self.read32(r1);
                let b = self.read32(r2);
                let count = self.mem[r2 as usize] as u32 & 31;
                let v = match op {
                    "add" => a.wrapping_add(b),
                    "sub" => a.wrapping_sub(b),
                    "mul" => a.wrapping_mul(b),
                    "div" if signed => (a as i32).checked_div(b as i32).ok_or_else(zero)? as u32,
                    "div" => a.checked_div(b).ok_or_else(zero)?,
                    "mod" if signed => (a as i32).checked_rem(b as i32).ok_or_else(zero)? as u32,
                    "mod" => a.checked_rem(b).ok_or_else(zero)?,
                    "and" => a & b,
                    "or" => a | b,
                    "xor" => a ^ b,
                    "shl" => a << count,
                    "shr" if signed => ((a as i32) >> count) as u32,
                    "shr" => a >> count,
                    "neg" => a.wrapping_neg(),
                    "not" => !a,
                    _ => return Err(format!("unsupported runtime helper '{}'", name)),
                };
                self.write32(r0, v);
            }
        }
        Ok(())
    }
}

/// Compiles `src` with `opts` and returns the assembly
pub fn assemble(src: &str, opts: CompileOptions) -> String {
    let opts = CompileOptions {
        file: "t.c".into(),
        ..opts
    };
    match Compiler::new(opts).compile(src) {
        Ok(out) => out.assembly,
        Err(e) => panic!("compilation failed:\n{}", e.render()),
    }
}

/// Compiles and runs `main`, returning its result
pub fn run_main_with(src: &str, opts: CompileOptions) -> i16 {
    let asm = assemble(src, opts);
    let mut m = Machine::load(&asm).unwrap_or_else(|e| panic!("{}\n{}", e, asm));
    m.call("main", &[]).unwrap_or_else(|e| panic!("{}\n{}", e, asm))
}

/// Compiles at the default level and runs `main`
pub fn run_main(src: &str) -> i16 {
    run_main_with(src, CompileOptions::default())
}
