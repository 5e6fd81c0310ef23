//! Commands that walk or mutate the session filesystem.

use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Local};

use super::command_trait::{CmdIn, CmdOut, Command, EXIT_FAILURE, EXIT_OK, EXIT_USAGE};
use super::context::CommandContext;
use super::{COLOR_DIR, COLOR_EXEC, COLOR_RESET};
use crate::shell::filesystem::base::base;
use crate::shell::filesystem::{normalize, EntryState};

fn mode_string(is_dir: bool, mode: u32) -> String {
    let mut s = String::with_capacity(10);
    s.push(if is_dir { 'd' } else { '-' });
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 7;
        s.push(if bits & 4 != 0 { 'r' } else { '-' });
        s.push(if bits & 2 != 0 { 'w' } else { '-' });
        s.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    s
}

fn format_size(size: u64) -> String {
    if size < 1024 {
        return size.to_string();
    }
    let units = ["", "K", "M", "G", "T", "P"];
    let exp = ((size as f64).ln() / 1024f64.ln()).floor() as usize;
    let exp = exp.min(units.len() - 1);
    let scaled = size as f64 / 1024f64.powi(exp as i32);
    if scaled < 10.0 && exp > 0 {
        format!("{scaled:.1}{}", units[exp])
    } else {
        format!("{scaled:.0}{}", units[exp])
    }
}

fn colorize(name: &str, is_dir: bool, mode: u32, use_color: bool) -> String {
    if !use_color {
        return name.to_string();
    }
    if is_dir {
        format!("{COLOR_DIR}{name}{COLOR_RESET}")
    } else if mode & 0o111 != 0 {
        format!("{COLOR_EXEC}{name}{COLOR_RESET}")
    } else {
        name.to_string()
    }
}

pub struct LsCommand;

#[async_trait]
impl Command for LsCommand {
    fn name(&self) -> &'static str {
        "ls"
    }

    fn aliases(&self) -> Vec<&'static str> {
        vec!["ll"]
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        let mut all = false;
        let mut long = args[0] == "ll";
        let mut human = false;
        let mut by_time = false;
        let mut reverse = false;
        let mut paths: Vec<String> = Vec::new();
        let use_color = out.is_tty();

        for arg in &args[1..] {
            if let Some(flags) = arg.strip_prefix('-') {
                for c in flags.chars() {
                    match c {
                        'a' => all = true,
                        'l' => long = true,
                        'h' => human = true,
                        't' => by_time = true,
                        'r' => reverse = true,
                        _ => {}
                    }
                }
            } else {
                paths.push(ctx.fs.abs(arg));
            }
        }
        if paths.is_empty() {
            paths.push(ctx.fs.cwd());
        }

        let mut code = EXIT_OK;
        for p in &paths {
            let files = match ctx.fs.list_dir(p) {
                Ok(f) => f,
                Err(err) => {
                    out.println(&format!("ls: 无法访问 '{p}': {err}")).await?;
                    code = EXIT_USAGE;
                    continue;
                }
            };

            // Snapshot the mutable state once so sorting and printing agree.
            let mut rows: Vec<(String, bool, EntryState)> = files
                .iter()
                .map(|e| (e.name.clone(), e.is_dir, e.read().clone()))
                .collect();
            if by_time {
                rows.sort_by(|a, b| b.2.mtime.cmp(&a.2.mtime));
            }
            if reverse {
                rows.reverse();
            }

            if long {
                let mut total = 0usize;
                for (name, _, st) in &rows {
                    if !all && name.starts_with('.') {
                        continue;
                    }
                    total += st.content.len() / 1024 + 4;
                }
                out.println(&format!("total {total}")).await?;

                for (name, is_dir, st) in &rows {
                    if !all && name.starts_with('.') {
                        continue;
                    }
                    let user = base().user_name(st.uid).unwrap_or("root");
                    let group = base().group_name(st.gid).unwrap_or("root");
                    let size = if human {
                        format_size(st.content.len() as u64)
                    } else {
                        st.content.len().to_string()
                    };
                    let when: DateTime<Local> = st.mtime.into();
                    out.println(&format!(
                        "{} {} {} {} {:>5} {} {}",
                        mode_string(*is_dir, st.mode),
                        st.nlink,
                        user,
                        group,
                        size,
                        when.format("%b %e %H:%M"),
                        colorize(name, *is_dir, st.mode, use_color),
                    ))
                    .await?;
                }
            } else {
                let mut line = String::new();
                for (name, is_dir, st) in &rows {
                    if !all && name.starts_with('.') {
                        continue;
                    }
                    line.push_str(&colorize(name, *is_dir, st.mode, use_color));
                    line.push_str("  ");
                }
                out.println(line.trim_end()).await?;
            }
        }
        Ok(code)
    }
}

pub struct CdCommand;

#[async_trait]
impl Command for CdCommand {
    fn name(&self) -> &'static str {
        "cd"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        match args.get(1) {
            Some(arg) => {
                let target = ctx.fs.abs(arg);
                match ctx.fs.entry(&target) {
                    Some(e) if e.is_dir => {
                        ctx.fs.set_cwd(target);
                        Ok(EXIT_OK)
                    }
                    _ => {
                        out.println(&format!("-bash: cd: {arg}: 没有那个文件或目录"))
                            .await?;
                        Ok(EXIT_FAILURE)
                    }
                }
            }
            None => {
                ctx.fs.set_cwd("/root".to_string());
                Ok(EXIT_OK)
            }
        }
    }
}

pub struct PwdCommand;

#[async_trait]
impl Command for PwdCommand {
    fn name(&self) -> &'static str {
        "pwd"
    }

    async fn run(
        &self,
        _args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        out.println(&ctx.fs.cwd()).await?;
        Ok(EXIT_OK)
    }
}

pub struct CatCommand;

#[async_trait]
impl Command for CatCommand {
    fn name(&self) -> &'static str {
        "cat"
    }

    async fn run(
        &self,
        args: &[String],
        input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        if args.len() == 1 {
            // Streamed, not slurped: upstream may be unbounded.
            tokio::io::copy(input.reader(), out.writer()).await?;
            return Ok(EXIT_OK);
        }

        let mut code = EXIT_OK;
        for f in &args[1..] {
            let p = ctx.fs.abs(f);
            if p == "/dev/null" {
                continue;
            }
            if p == "/dev/zero" {
                out.write_all(&[0u8; 1024]).await?;
                continue;
            }
            match ctx.fs.read_file(&p) {
                Ok(content) => {
                    out.write_all(&content).await?;
                    if content.last().is_some_and(|&b| b != b'\n') {
                        out.write_all(b"\n").await?;
                    }
                }
                Err(err) => {
                    out.println(&format!("cat: {f}: {err}")).await?;
                    code = EXIT_FAILURE;
                }
            }
        }
        Ok(code)
    }
}

pub struct CpCommand;

#[async_trait]
impl Command for CpCommand {
    fn name(&self) -> &'static str {
        "cp"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        if args.len() < 3 {
            return Ok(EXIT_OK);
        }
        let src = ctx.fs.abs(&args[1]);
        let mut dst = ctx.fs.abs(&args[2]);
        match ctx.fs.entry(&src) {
            None => {
                out.println(&format!(
                    "cp: 无法获取 '{}' 的状态: 没有那个文件或目录",
                    args[1]
                ))
                .await?;
                Ok(EXIT_FAILURE)
            }
            Some(e) if e.is_dir => {
                out.println(&format!("cp: -r 未指定; 省略目录 '{}'", args[1]))
                    .await?;
                Ok(EXIT_FAILURE)
            }
            Some(e) => {
                if let Some(d) = ctx.fs.entry(&dst) {
                    if d.is_dir {
                        dst = normalize(&format!("{dst}/{}", e.name));
                    }
                }
                let st = e.read().clone();
                let _ = ctx.fs.write(&dst, st.content, Some(st.mode));
                Ok(EXIT_OK)
            }
        }
    }
}

pub struct MvCommand;

#[async_trait]
impl Command for MvCommand {
    fn name(&self) -> &'static str {
        "mv"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        if args.len() < 3 {
            return Ok(EXIT_OK);
        }
        let src = ctx.fs.abs(&args[1]);
        let mut dst = ctx.fs.abs(&args[2]);
        if let Some(d) = ctx.fs.entry(&dst) {
            if d.is_dir {
                dst = normalize(&format!(
                    "{dst}/{}",
                    crate::shell::filesystem::basename(&src)
                ));
            }
        }
        match ctx.fs.rename(&src, &dst) {
            Ok(()) => Ok(EXIT_OK),
            Err(err) => {
                out.println(&format!("mv: {err}")).await?;
                Ok(EXIT_FAILURE)
            }
        }
    }
}

pub struct MkdirCommand;

#[async_trait]
impl Command for MkdirCommand {
    fn name(&self) -> &'static str {
        "mkdir"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        _out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        for d in &args[1..] {
            if !d.starts_with('-') {
                let _ = ctx.fs.mkdir(&ctx.fs.abs(d));
            }
        }
        Ok(EXIT_OK)
    }
}

pub struct RmCommand;

#[async_trait]
impl Command for RmCommand {
    fn name(&self) -> &'static str {
        "rm"
    }

    fn aliases(&self) -> Vec<&'static str> {
        vec!["rmdir"]
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        let mut code = EXIT_OK;
        for f in &args[1..] {
            if f.starts_with('-') {
                continue;
            }
            let p = ctx.fs.abs(f);
            if ctx.fs.entry(&p).is_some() {
                let _ = ctx.fs.remove(&p);
            } else {
                out.println(&format!("rm: 无法删除 '{f}': 没有那个文件或目录"))
                    .await?;
                code = EXIT_FAILURE;
            }
        }
        Ok(code)
    }
}

pub struct TouchCommand;

#[async_trait]
impl Command for TouchCommand {
    fn name(&self) -> &'static str {
        "touch"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        _out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        for f in &args[1..] {
            let p = ctx.fs.abs(f);
            if ctx.fs.entry(&p).is_none() {
                let _ = ctx.fs.write(&p, Vec::new(), Some(0o644));
            }
        }
        Ok(EXIT_OK)
    }
}

pub struct ChmodCommand;

#[async_trait]
impl Command for ChmodCommand {
    fn name(&self) -> &'static str {
        "chmod"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        if args.len() < 3 {
            return Ok(EXIT_OK);
        }
        match u32::from_str_radix(&args[1], 8) {
            Ok(mode) => {
                for f in &args[2..] {
                    let _ = ctx.fs.chmod(&ctx.fs.abs(f), mode);
                }
                Ok(EXIT_OK)
            }
            Err(_) => {
                out.println(&format!("chmod: 无效模式: '{}'", args[1])).await?;
                Ok(EXIT_FAILURE)
            }
        }
    }
}

pub struct ChownCommand;

#[async_trait]
impl Command for ChownCommand {
    fn name(&self) -> &'static str {
        "chown"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        if args.len() < 3 {
            out.println("chown: 缺少操作数").await?;
            return Ok(EXIT_FAILURE);
        }
        let mut spec = args[1].splitn(2, ':');
        let uid = spec.next().map(resolve_uid).unwrap_or(-1);
        let gid = spec.next().map(resolve_gid).unwrap_or(-1);
        for f in &args[2..] {
            let _ = ctx.fs.chown(&ctx.fs.abs(f), uid, gid);
        }
        Ok(EXIT_OK)
    }
}

fn resolve_uid(name: &str) -> i64 {
    if let Ok(n) = name.parse::<u32>() {
        return n as i64;
    }
    base().uid_of(name).map(|u| u as i64).unwrap_or(-1)
}

fn resolve_gid(name: &str) -> i64 {
    if let Ok(n) = name.parse::<u32>() {
        return n as i64;
    }
    base().gid_of(name).map(|g| g as i64).unwrap_or(-1)
}
