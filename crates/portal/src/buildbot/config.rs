//! Buildbot master configuration
//!
//! [`ConfigGenerator`] turns the worker set and the discovered Gerrit
//! projects into the text of `master.cfg`. It is a pure function of its
//! inputs: projects are ordered by id first, so the same set always yields
//! byte-identical output. Writing the file and running `checkconfig` belong
//! to the caller.

use crate::gerrit::Project;
use crate::{Error, Result};
use std::fmt::Write;
use std::path::PathBuf;

/// A Buildbot worker and its password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    /// Worker name, also its directory under the Buildbot state dir
    pub name: String,
    /// Password the worker uses to attach to the master
    pub password: String,
}

/// Parse a comma-separated `name,password,name,password,...` list
pub fn parse_workers(list: &str) -> Result<Vec<Worker>> {
    let parts: Vec<&str> = list.split(',').collect();
    if parts.len() % 2 != 0 {
        return Err(Error::config(format!(
            "--buildbot-workers is invalid because it has {} parts",
            parts.len()
        )));
    }
    parts
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| {
            let name = pair[0].trim();
            if name.is_empty() {
                return Err(Error::config(format!(
                    "--buildbot-workers has an empty worker name @{}",
                    i * 2
                )));
            }
            Ok(Worker {
                name: name.to_string(),
                password: pair[1].to_string(),
            })
        })
        .collect()
}

/// Everything about the master that is not a project or a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterSettings {
    /// Scheme of the public URL
    pub www_protocol: String,
    /// Host of the public URL
    pub www_host: String,
    /// Port the web UI listens on
    pub www_port: u16,
    /// Port of the public URL
    pub public_port: u16,
    /// Interface workers connect to
    pub pb_host: String,
    /// Port workers connect to
    pub pb_port: u16,
    /// Database URL
    pub db_url: String,
    /// PATH for build steps
    pub env_path: String,
    /// Private key of the `buildbot` Gerrit account
    pub identity_file: PathBuf,
    /// Gerrit SSH host
    pub gerrit_server: String,
    /// Gerrit SSH port
    pub gerrit_port: u16,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            www_protocol: "http".to_string(),
            www_host: "127.0.0.1".to_string(),
            www_port: 8010,
            public_port: 8010,
            pb_host: "127.0.0.1".to_string(),
            pb_port: 9989,
            db_url: "sqlite:///state.sqlite".to_string(),
            env_path: "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin".to_string(),
            identity_file: PathBuf::new(),
            gerrit_server: "127.0.0.1".to_string(),
            gerrit_port: 29418,
        }
    }
}

impl MasterSettings {
    /// Public URL of the web UI, without a trailing slash
    pub fn buildbot_url(&self) -> String {
        format!("{}://{}:{}", self.www_protocol, self.www_host, self.public_port)
    }

    /// `host:port` workers attach to
    pub fn master_address(&self) -> String {
        format!("{}:{}", self.pb_host, self.pb_port)
    }
}

/// Renders `master.cfg`
#[derive(Debug, Clone)]
pub struct ConfigGenerator {
    settings: MasterSettings,
    workers: Vec<Worker>,
}

impl ConfigGenerator {
    /// Generator for the given master and workers
    pub fn new(settings: MasterSettings, workers: Vec<Worker>) -> Self {
        Self { settings, workers }
    }

    /// Master settings
    pub fn settings(&self) -> &MasterSettings {
        &self.settings
    }

    /// Full configuration text for `projects`
    ///
    /// With no projects the master gets a single dummy builder so it can
    /// still boot.
    pub fn generate(&self, projects: &[Project]) -> String {
        let mut projects = projects.to_vec();
        projects.sort_by(|a, b| a.id.cmp(&b.id));

        let mut out = String::new();
        self.write_header(&mut out);
        if projects.is_empty() {
            write_dummy(&mut out);
        } else {
            self.write_change_source(&mut out);
            for project in &projects {
                self.write_project(&mut out, project);
            }
            self.write_status_push(&mut out);
        }
        out
    }

    fn write_header(&self, out: &mut String) {
        let s = &self.settings;
        let url = format!("{}/", s.buildbot_url());
        out.push_str(
            "from buildbot.plugins import *\n\
             from buildbot.reporters.gerrit import GerritStatusPush\n\
             from buildbot.reporters.http import HttpStatusPush\n\
             from buildbot.reporters.generators.build import BuildStatusGenerator\n\
             from buildbot.reporters.message import MessageFormatterFunction\n\
             \n\
             c = BuildmasterConfig = {}\n\
             c['buildbotNetUsageData'] = None\n",
        );
        let _ = writeln!(out, "c['buildbotURL'] = '{}'", url);
        let _ = writeln!(out, "c['db'] = {{'db_url': '{}'}}", s.db_url);
        let _ = writeln!(
            out,
            "c['protocols'] = {{'pb': {{'port': 'tcp:{}:interface={}'}}}}",
            s.pb_port, s.pb_host
        );
        out.push_str("c['title'] = 'Buildbot'\n");
        let _ = writeln!(out, "c['titleURL'] = '{}'", url);
        let _ = write!(
            out,
            "\nc['www'] = dict(port=\"tcp:{}:interface={}\",\n\
             \x20               auth=util.RemoteUserAuth(header=\"X-Remote-User\",\n\
             \x20                                        headerRegex=\"(?P<username>.+)\"),\n\
             \x20               plugins={{'base_react': {{}}}},\n\
             \x20               change_hook_dialects={{'gitlab': True, 'github': {{}}}})\n",
            s.www_port, s.pb_host
        );
        out.push_str(
            "\nc['change_source'] = []\n\
             c['schedulers'] = []\n\
             c['builders'] = []\n\
             c['services'] = []\n\
             c['workers'] = []\n\n",
        );
        for worker in &self.workers {
            let _ = writeln!(
                out,
                "c['workers'].append(worker.Worker('{}', '{}', keepalive_interval=60))",
                worker.name, worker.password
            );
        }
    }

    fn write_change_source(&self, out: &mut String) {
        let s = &self.settings;
        let _ = write!(
            out,
            "\nc['change_source'].append(changes.GerritChangeSource(\n\
             \tgerritserver='{}',\n\
             \tgerritport='{}',\n\
             \tusername='buildbot',\n\
             \tidentity_file='{}',\n\
             \thandled_events=['patchset-created'],\n\
             \tget_files=True,\n\
             \tdebug=True\n\
             ))\n",
            s.gerrit_server,
            s.gerrit_port,
            s.identity_file.display()
        );
    }

    fn write_project(&self, out: &mut String, project: &Project) {
        let s = &self.settings;
        let name = &project.name;
        let _ = write!(
            out,
            "\nc['schedulers'].append(schedulers.AnyBranchScheduler(\n\
             \tname='{name} presubmit scheduler',\n\
             \tchange_filter=util.GerritChangeFilter(\n\
             \t\tproject='{name}',\n\
             \t\teventtype='patchset-created'\n\
             \t),\n\
             \ttreeStableTimer=None,\n\
             \tbuilderNames=['{name} presubmit']\n\
             ))\n"
        );
        let _ = write!(
            out,
            "\nc['schedulers'].append(schedulers.ForceScheduler(\n\
             \tname='{name} force',\n\
             \tbuilderNames=['{name} presubmit']\n\
             ))\n"
        );
        let _ = write!(
            out,
            "\nfactory = util.BuildFactory()\n\
             factory.addStep(steps.Gerrit(\n\
             \trepourl='ssh://buildbot@{}:{}/{}.git',\n\
             \tsshPrivateKey=open('{}').read(),\n\
             \tsubmodules=True,\n\
             \tretryFetch=True,\n\
             \tclobberOnFailure=True,\n\
             \tmode='full',\n\
             \tmethod='fresh'\n\
             ))\n",
            s.gerrit_server,
            s.gerrit_port,
            project.id,
            s.identity_file.display()
        );
        let _ = write!(
            out,
            "\nfactory.addStep(steps.TreeSize())\n\
             factory.addStep(steps.Compile(\n\
             \tname='compile',\n\
             \tcommand=['make'],\n\
             \tdescription='compiling',\n\
             \tdescriptionDone='compiles'\n\
             ))\n\
             factory.addStep(steps.Test(\n\
             \tname='test',\n\
             \tcommand=['make', 'test'],\n\
             \tdescription='testing',\n\
             \tdescriptionDone='tests'\n\
             ))\n\
             c['builders'].append(util.BuilderConfig(\n\
             \tname='{name} presubmit',\n\
             \t{}\n\
             \tfactory=factory,\n\
             \tenv={{\n\
             \t\t'PATH': '{}',\n\
             \t\t'CI': 'true'\n\
             \t}}\n\
             ))\n",
            self.worker_names(),
            s.env_path
        );
    }

    fn write_status_push(&self, out: &mut String) {
        let s = &self.settings;
        let _ = write!(
            out,
            "\nc['services'].append(GerritStatusPush(\n\
             \tserver='{}',\n\
             \tport={},\n\
             \tusername='buildbot',\n\
             \tidentity_file='{}'\n\
             ))\n",
            s.gerrit_server,
            s.gerrit_port,
            s.identity_file.display()
        );
    }

    fn worker_names(&self) -> String {
        let names: Vec<String> = self
            .workers
            .iter()
            .map(|w| format!("'{}'", w.name))
            .collect();
        format!("workernames=[{}], ", names.join(", "))
    }
}

fn write_dummy(out: &mut String) {
    out.push_str(
        "\nc['workers'].append(worker.Worker('dummy', 'dummy'))\n\
         factory = util.BuildFactory()\n\
         factory.addStep(steps.ShellCommand(command=['/bin/true']))\n\
         c['builders'].append(util.BuilderConfig(name='dummy', workername='dummy', factory=factory))\n\
         c['schedulers'].append(schedulers.ForceScheduler(name='dummy', builderNames=['dummy']))\n",
    );
}
