/// The filesystem view of a traced process
///
/// `root_dir` models the effect of `chroot` and `work_dir` the effect of
/// `chdir`; the working directory is interpreted under the root.
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct ProcessState {
    pub root_dir : String,
    pub work_dir : String
}

impl ProcessState {
    pub fn new(root_dir : &str, work_dir : &str) -> ProcessState {
        ProcessState { root_dir : root_dir.to_owned(), work_dir : work_dir.to_owned() }
    }

    pub fn chdir(&mut self, path : &str) {
        self.work_dir = change_dir(&self.work_dir, path);
    }

    pub fn chroot(&mut self, path : &str) {
        self.root_dir = change_dir(&self.root_dir, path);
    }

    /// The working directory as seen from outside the chroot
    pub fn host_work_dir(&self) -> String {
        under_root(&self.work_dir, &self.root_dir)
    }
}

/// Model `cd`: absolute paths replace the old directory, relative paths are
/// appended to it.
///
/// No normalization happens here (`..` and duplicate separators are kept),
/// the result is only ever handed back to a shell.
pub fn change_dir(old_dir : &str, new_dir : &str) -> String {
    if new_dir.starts_with('/') {
        new_dir.to_owned()
    } else {
        format!("{}/{}", old_dir, new_dir)
    }
}

/// Re-anchor an absolute path under `root_dir`
///
/// Relative paths are returned untouched since they resolve against the
/// working directory, which is itself rewritten.
pub fn under_root(path : &str, root_dir : &str) -> String {
    if path.starts_with('/') {
        format!("{}{}", root_dir.trim_end_matches('/'), path)
    } else {
        path.to_owned()
    }
}
